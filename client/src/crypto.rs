//! Recovery of the socket token from the reservation challenge.
//!
//! The challenge is an obfuscated script. It passes a quoted message to `decode.call(..)`
//! and computes an integer `offset`. Each message character yields one key character,
//! and the key is XORed against the base64-decoded session token.
//!
//! The shape of the `offset` expression has changed between protocol revisions, so it is
//! located by an ordered list of [`OffsetMatcher`]s. When none applies, a heuristic over the
//! integer literals in the text is used.

use crate::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::{Captures, Regex};
use std::fmt;
use tracing::{debug, info};

const KEY_MODULUS: i128 = 77;
const KEY_BASE: i128 = 48;

/// Everything outside the RFC 3986 unreserved set is percent-encoded.
const TOKEN_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptStage {
    Message,
    Offset,
    Key,
    Xor,
}

impl fmt::Display for DecryptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecryptStage::Message => "message",
            DecryptStage::Offset => "offset",
            DecryptStage::Key => "key",
            DecryptStage::Xor => "xor",
        })
    }
}

fn failure(stage: DecryptStage, reason: impl Into<String>) -> Error {
    Error::Decryption {
        stage,
        reason: reason.into(),
    }
}

lazy_static! {
    static ref MESSAGE_PATTERN: Regex =
        Regex::new(r"decode\.call\(this,\s*'([^']+)'").expect("message pattern is valid");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("whitespace pattern is valid");
    static ref LITERAL_PATTERN: Regex = Regex::new(r"\b\d+\b").expect("literal pattern is valid");
    static ref BUILTIN_MATCHERS: Vec<OffsetMatcher> = builtin_matchers();
}

/// One known shape of the `offset` expression.
#[derive(Clone)]
pub struct OffsetMatcher {
    name: &'static str,
    pattern: Regex,
    evaluate: fn(&Captures<'_>) -> Option<i64>,
}

impl OffsetMatcher {
    pub fn new(
        name: &'static str,
        pattern: &str,
        evaluate: fn(&Captures<'_>) -> Option<i64>,
    ) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            evaluate,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, text: &str) -> Option<i64> {
        let captures = self.pattern.captures(text)?;
        (self.evaluate)(&captures)
    }
}

/// The historical offset shapes, most specific first.
fn builtin_matchers() -> Vec<OffsetMatcher> {
    let builtins: [(&'static str, &str, fn(&Captures<'_>) -> Option<i64>); 4] = [
        (
            "((a+b)+c+(d+e))+f",
            r"offset\s*=\s*\(\(\s*(\d+)\s*\+\s*(\d+)\s*\)\s*\+\s*(\d+)\s*\+\s*\(\s*(\d+)\s*\+\s*(\d+)\s*\)\)\s*\+\s*(\d+)",
            |caps| groups::<6>(caps).and_then(|[a, b, c, d, e, f]| nested_sum(a, b, c, d, e, f)),
        ),
        (
            "(a+b)*(c+d)",
            r"offset\s*=\s*\(\(\s*(\d+)\s*\+\s*(\d+)\s*\)\s*\*\s*\(\s*(\d+)\s*\+\s*(\d+)\s*\)\)",
            |caps| groups::<4>(caps).and_then(|[a, b, c, d]| sum_product(a, b, c, d)),
        ),
        (
            "((a+b)*c*(d+e))",
            r"offset\s*=\s*\(\(\s*(\d+)\s*\+\s*(\d+)\s*\)\s*\*\s*(\d+)\s*\*\s*\(\s*(\d+)\s*\+\s*(\d+)\s*\)\)",
            |caps| groups::<5>(caps).and_then(|[a, b, c, d, e]| triple_product(a, b, c, d, e)),
        ),
        (
            "arithmetic_expression",
            r"offset\s*=\s*(\([^;]+);",
            |caps| evaluate_expression(caps.get(1)?.as_str()),
        ),
    ];
    builtins
        .into_iter()
        .map(|(name, pattern, evaluate)| {
            OffsetMatcher::new(name, pattern, evaluate).expect("builtin offset pattern is valid")
        })
        .collect()
}

fn groups<const N: usize>(caps: &Captures<'_>) -> Option<[i64; N]> {
    let mut values = [0i64; N];
    for (i, value) in values.iter_mut().enumerate() {
        *value = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    Some(values)
}

fn nested_sum(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64) -> Option<i64> {
    a.checked_add(b)?
        .checked_add(c)?
        .checked_add(d.checked_add(e)?)?
        .checked_add(f)
}

fn sum_product(a: i64, b: i64, c: i64, d: i64) -> Option<i64> {
    a.checked_add(b)?.checked_mul(c.checked_add(d)?)
}

fn triple_product(a: i64, b: i64, c: i64, d: i64, e: i64) -> Option<i64> {
    a.checked_add(b)?.checked_mul(c)?.checked_mul(d.checked_add(e)?)
}

/// Last-resort offset derived from how many integer literals the challenge contains.
pub fn fallback_offset(literals: &[i64]) -> Option<i64> {
    match *literals {
        [a, b, c, d, e, f, ..] => nested_sum(a, b, c, d, e, f),
        [a, b, c, d, e] => triple_product(a, b, c, d, e),
        [a, b, c, d] => sum_product(a, b, c, d),
        [] => None,
        _ => literals.iter().try_fold(0i64, |acc, n| acc.checked_add(*n)),
    }
}

/// Integer evaluation of an expression over digits, `+`, `*` and parentheses.
///
/// Every other character is discarded before parsing. Returns `None` for malformed input
/// or on overflow.
pub fn evaluate_expression(expression: &str) -> Option<i64> {
    let tokens: Vec<u8> = expression
        .bytes()
        .filter(|b| b.is_ascii_digit() || matches!(b, b'+' | b'*' | b'(' | b')'))
        .collect();
    let mut parser = ExpressionParser {
        tokens: &tokens,
        pos: 0,
    };
    let value = parser.sum()?;
    (parser.pos == tokens.len()).then_some(value)
}

struct ExpressionParser<'a> {
    tokens: &'a [u8],
    pos: usize,
}

impl ExpressionParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.tokens.get(self.pos).copied()
    }

    fn sum(&mut self) -> Option<i64> {
        let mut value = self.product()?;
        while self.peek() == Some(b'+') {
            self.pos += 1;
            value = value.checked_add(self.product()?)?;
        }
        Some(value)
    }

    fn product(&mut self) -> Option<i64> {
        let mut value = self.factor()?;
        while self.peek() == Some(b'*') {
            self.pos += 1;
            value = value.checked_mul(self.factor()?)?;
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<i64> {
        match self.peek()? {
            b'(' => {
                self.pos += 1;
                let value = self.sum()?;
                if self.peek() != Some(b')') {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            b'0'..=b'9' => {
                let start = self.pos;
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
                std::str::from_utf8(&self.tokens[start..self.pos])
                    .ok()?
                    .parse()
                    .ok()
            }
            _ => None,
        }
    }
}

/// Key derivation: `(codepoint * position + offset) mod 77 + 48` per message character.
pub fn generate_key(message: &str, offset: i64) -> String {
    message
        .chars()
        .enumerate()
        .map(|(position, ch)| {
            let code = (ch as u32 as i128 * position as i128 + offset as i128)
                .rem_euclid(KEY_MODULUS)
                + KEY_BASE;
            // `code` is always within 48..125.
            char::from(code as u8)
        })
        .collect()
}

/// XOR each character of `input` with the key character at `i mod key length`.
fn xor_chars(input: &str, key: &str) -> Result<String> {
    let key: Vec<u32> = key.chars().map(u32::from).collect();
    if key.is_empty() {
        return Err(failure(DecryptStage::Key, "empty key"));
    }
    input
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            let code = u32::from(ch) ^ key[i % key.len()];
            char::from_u32(code).ok_or_else(|| {
                failure(
                    DecryptStage::Xor,
                    format!("invalid code point {code:#x} at position {i}"),
                )
            })
        })
        .collect()
}

/// Inverse of [`xor_decrypt`]: XOR then base64-encode.
pub fn xor_encrypt(plain: &str, key: &str) -> Result<String> {
    let mixed = xor_chars(plain, key)?;
    Ok(general_purpose::STANDARD.encode(mixed.as_bytes()))
}

/// Base64-decode the token and XOR it with `key`.
pub fn xor_decrypt(encrypted_token: &str, key: &str) -> Result<String> {
    let decoded = general_purpose::STANDARD
        .decode(encrypted_token.trim())
        .map_err(|err| failure(DecryptStage::Xor, format!("invalid base64: {err}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|err| failure(DecryptStage::Xor, format!("token is not utf-8: {err}")))?;
    xor_chars(&decoded, key)
}

/// Turns a reservation challenge and its encrypted token into the socket token.
pub struct TokenDecryptor {
    matchers: Vec<OffsetMatcher>,
}

impl Default for TokenDecryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenDecryptor {
    pub fn new() -> Self {
        Self {
            matchers: BUILTIN_MATCHERS.clone(),
        }
    }

    /// Append a matcher for a new expression shape. It is tried after the existing ones.
    pub fn with_matcher(mut self, matcher: OffsetMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matchers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.matchers.iter().map(OffsetMatcher::name)
    }

    pub fn extract_message(&self, challenge: &str) -> Result<String> {
        MESSAGE_PATTERN
            .captures(challenge)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| failure(DecryptStage::Message, "no decode.call message in challenge"))
    }

    pub fn extract_offset(&self, challenge: &str) -> Result<i64> {
        let text = WHITESPACE.replace_all(challenge, " ");
        for matcher in &self.matchers {
            if let Some(offset) = matcher.apply(&text) {
                debug!(matcher = matcher.name, offset, "offset pattern matched");
                return Ok(offset);
            }
        }

        // A literal that does not fit would shift the count and pick the wrong formula.
        let literals = LITERAL_PATTERN
            .find_iter(&text)
            .map(|m| {
                m.as_str().parse::<i64>().map_err(|_| {
                    failure(
                        DecryptStage::Offset,
                        format!("integer literal {} out of range", m.as_str()),
                    )
                })
            })
            .collect::<Result<Vec<i64>>>()?;
        debug!(count = literals.len(), "no offset pattern matched, using literal fallback");
        fallback_offset(&literals)
            .ok_or_else(|| failure(DecryptStage::Offset, "no integer literals in challenge"))
    }

    /// Full pipeline. The result is percent-encoded and ready to embed in the socket URL.
    pub fn decrypt(&self, encrypted_token: &str, challenge: &str) -> Result<String> {
        let message = self.extract_message(challenge)?;
        let offset = self.extract_offset(challenge)?;
        let key = generate_key(&message, offset);
        if key.is_empty() {
            return Err(failure(DecryptStage::Key, "empty key"));
        }
        debug!(message_len = message.len(), offset, "derived token key");

        let token = xor_decrypt(encrypted_token, &key)?;
        info!("decrypted session token");
        Ok(utf8_percent_encode(&token, TOKEN_ESCAPE).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn challenge(offset_expr: &str) -> String {
        format!(
            "decode.call(this, 'kZqLmWb'); function decode(message) {{ var offset = {offset_expr}; \
             if (this.angular.isArray(offset)) console.log(\"Offset derived as: {{\", offset, \"}}\"); \
             return _.replace(message, /./g, function(char, position) {{ return char; }}); }}"
        )
    }

    #[test]
    fn test_extract_message() {
        let decryptor = TokenDecryptor::new();
        assert_eq!(
            decryptor.extract_message(&challenge("1")).unwrap(),
            "kZqLmWb"
        );
        let err = decryptor.extract_message("var offset = 3;").unwrap_err();
        assert!(matches!(
            err,
            Error::Decryption {
                stage: DecryptStage::Message,
                ..
            }
        ));
    }

    #[test]
    fn test_nested_sum_pattern() {
        let decryptor = TokenDecryptor::new();
        let offset = decryptor
            .extract_offset(&challenge("((12 + 34) + 5 + (6 + 7)) + 8"))
            .unwrap();
        assert_eq!(offset, ((12 + 34) + 5 + (6 + 7)) + 8);
    }

    #[test]
    fn test_sum_product_pattern() {
        let decryptor = TokenDecryptor::new();
        let offset = decryptor
            .extract_offset(&challenge("((10 + 20) * (3 + 4))"))
            .unwrap();
        assert_eq!(offset, (10 + 20) * (3 + 4));
    }

    #[test]
    fn test_triple_product_pattern() {
        let decryptor = TokenDecryptor::new();
        let offset = decryptor
            .extract_offset(&challenge("((1 + 2) * 3 * (4 + 5))"))
            .unwrap();
        assert_eq!(offset, (1 + 2) * 3 * (4 + 5));
    }

    #[test]
    fn test_generic_expression_pattern() {
        let decryptor = TokenDecryptor::new();
        let offset = decryptor
            .extract_offset(&challenge("(7 * (2 + 3)) + 1 * 4"))
            .unwrap();
        assert_eq!(offset, (7 * (2 + 3)) + 4);
    }

    #[test]
    fn test_unicode_whitespace_is_normalised() {
        let decryptor = TokenDecryptor::new();
        let text = "decode.call(this, 'ab'); var offset\u{2003}=\u{2003}((10\u{2003}+ 20) * (3 + 4));";
        assert_eq!(decryptor.extract_offset(text).unwrap(), 210);
    }

    #[test]
    fn test_literal_fallback_by_count() {
        let decryptor = TokenDecryptor::new();
        let text = |values: &str| format!("decode.call(this, 'abc'); var v = [{values}];");

        assert_eq!(
            decryptor.extract_offset(&text("1, 2, 3, 4, 5, 6, 7")).unwrap(),
            ((1 + 2) + 3 + (4 + 5)) + 6
        );
        assert_eq!(
            decryptor.extract_offset(&text("1, 2, 3, 4, 5")).unwrap(),
            (1 + 2) * 3 * (4 + 5)
        );
        assert_eq!(
            decryptor.extract_offset(&text("2, 3, 4, 5")).unwrap(),
            (2 + 3) * (4 + 5)
        );
        assert_eq!(decryptor.extract_offset(&text("7, 8")).unwrap(), 15);
        assert_eq!(decryptor.extract_offset(&text("7")).unwrap(), 7);

        let err = decryptor.extract_offset(&text("")).unwrap_err();
        assert!(matches!(
            err,
            Error::Decryption {
                stage: DecryptStage::Offset,
                ..
            }
        ));
    }

    #[test]
    fn test_evaluate_expression() {
        assert_eq!(evaluate_expression("(1+2)*3"), Some(9));
        assert_eq!(evaluate_expression("2+3*4"), Some(14));
        assert_eq!(evaluate_expression("((5))"), Some(5));
        assert_eq!(evaluate_expression("(1+2"), None);
        assert_eq!(evaluate_expression("1+"), None);
        assert_eq!(evaluate_expression(""), None);
        assert_eq!(evaluate_expression("99999999999*99999999999"), None);
        // Anything but digits, + * and parentheses is discarded before parsing.
        assert_eq!(evaluate_expression("(3 - 1) * x2"), Some(62));
    }

    #[test]
    fn test_appended_matcher_runs_after_builtins() {
        let decryptor = TokenDecryptor::new().with_matcher(
            OffsetMatcher::new("a-b", r"offset\s*=\s*(\d+)\s*-\s*(\d+)", |caps| {
                let a: i64 = caps.get(1)?.as_str().parse().ok()?;
                let b: i64 = caps.get(2)?.as_str().parse().ok()?;
                a.checked_sub(b)
            })
            .unwrap(),
        );
        assert_eq!(decryptor.matchers().last(), Some("a-b"));
        assert_eq!(decryptor.extract_offset(&challenge("50 - 8")).unwrap(), 42);
    }

    #[test]
    fn test_generate_key() {
        // p0: (97*0) % 77 + 48 = '0'; p1: (98*1) % 77 + 48 = 69 = 'E'
        assert_eq!(generate_key("ab", 0), "0E");
        assert_eq!(generate_key("ab", 77), "0E");
        assert_eq!(generate_key("", 5), "");
        assert!(generate_key("kZqLmWb", 123_456_789)
            .chars()
            .all(|c| ('0'..='}').contains(&c)));
    }

    #[test]
    fn test_decrypt_escapes_token() {
        let decryptor = TokenDecryptor::new();
        let text = challenge("((10 + 20) * (3 + 4))");
        let key = generate_key("kZqLmWb", 210);
        let token = xor_encrypt("tok/en+1 a~b", &key).unwrap();

        let first = decryptor.decrypt(&token, &text).unwrap();
        assert_eq!(first, "tok%2Fen%2B1%20a~b");
        assert_eq!(decryptor.decrypt(&token, &text).unwrap(), first);
    }

    #[test]
    fn test_decrypt_rejects_bad_token() {
        let decryptor = TokenDecryptor::new();
        let err = decryptor
            .decrypt("not base64!!", &challenge("((10 + 20) * (3 + 4))"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Decryption {
                stage: DecryptStage::Xor,
                ..
            }
        ));
    }

    #[test]
    fn test_xor_reports_invalid_code_point() {
        // U+E800 ^ U+3000 lands on the surrogate U+D800.
        let token = general_purpose::STANDARD.encode("\u{E800}");
        let err = xor_decrypt(&token, "\u{3000}").unwrap_err();
        match err {
            Error::Decryption { stage, reason } => {
                assert_eq!(stage, DecryptStage::Xor);
                assert!(reason.contains("0xd800"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = xor_decrypt(&token, "").unwrap_err();
        assert!(matches!(
            err,
            Error::Decryption {
                stage: DecryptStage::Key,
                ..
            }
        ));
    }

    #[test]
    fn test_oversized_literal_fails_offset() {
        let decryptor = TokenDecryptor::new();
        let text = "decode.call(this, 'abc'); var v = [2, 3, 99999999999999999999, 4, 5];";
        let err = decryptor.extract_offset(text).unwrap_err();
        match err {
            Error::Decryption { stage, reason } => {
                assert_eq!(stage, DecryptStage::Offset);
                assert!(reason.contains("99999999999999999999"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decryptors_share_builtin_matchers() {
        let first: Vec<_> = TokenDecryptor::new().matchers().collect();
        let second: Vec<_> = TokenDecryptor::default().matchers().collect();
        assert_eq!(
            first,
            [
                "((a+b)+c+(d+e))+f",
                "(a+b)*(c+d)",
                "((a+b)*c*(d+e))",
                "arithmetic_expression"
            ]
        );
        assert_eq!(first, second);

        let extended = TokenDecryptor::new().with_matcher(
            OffsetMatcher::new("a-b", r"offset\s*=\s*(\d+)\s*-\s*(\d+)", |_| None).unwrap(),
        );
        assert_eq!(extended.matchers().count(), 5);
        assert_eq!(TokenDecryptor::new().matchers().count(), 4);
    }

    proptest! {
        #[test]
        fn prop_xor_round_trip(
            message in "[a-zA-Z0-9]{1,40}",
            offset in 0i64..1_000_000,
            plain in "\\PC{0,64}",
        ) {
            let key = generate_key(&message, offset);
            let encrypted = xor_encrypt(&plain, &key).unwrap();
            prop_assert_eq!(xor_decrypt(&encrypted, &key).unwrap(), plain);
        }
    }
}
