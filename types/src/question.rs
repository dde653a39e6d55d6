//! Question payloads carried in the JSON-encoded `content` of game-channel packets.

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuestionType {
    Quiz,
    MultipleSelectQuiz,
    Slider,
    OpenEnded,
    Jumble,
    Unknown,
}

impl QuestionType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "quiz" => QuestionType::Quiz,
            "multiple_select_quiz" => QuestionType::MultipleSelectQuiz,
            "slider" => QuestionType::Slider,
            "open_ended" => QuestionType::OpenEnded,
            "jumble" => QuestionType::Jumble,
            _ => QuestionType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Quiz => "quiz",
            QuestionType::MultipleSelectQuiz => "multiple_select_quiz",
            QuestionType::Slider => "slider",
            QuestionType::OpenEnded => "open_ended",
            QuestionType::Jumble => "jumble",
            QuestionType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quiz, multi-select and jumble questions: a fixed set of indexed choices.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceQuestion {
    #[serde(default)]
    pub game_block_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    /// `TRUE_FALSE` for two-choice quiz questions.
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub number_of_choices: Option<u32>,
    /// Milliseconds.
    #[serde(default)]
    pub time_available: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderQuestion {
    #[serde(default)]
    pub game_block_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub min_range: Option<f64>,
    #[serde(default)]
    pub max_range: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub time_available: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextQuestion {
    #[serde(default)]
    pub game_block_index: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time_available: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Question content keyed by its `type` tag.
///
/// Payloads whose tag is unrecognised, or whose fields do not fit the tagged shape, are
/// kept verbatim in [`QuestionContent::Unknown`].
#[derive(Clone, Debug, PartialEq)]
pub enum QuestionContent {
    Quiz(ChoiceQuestion),
    MultipleSelectQuiz(ChoiceQuestion),
    Slider(SliderQuestion),
    OpenEnded(TextQuestion),
    Jumble(ChoiceQuestion),
    Unknown { tag: Option<String>, raw: Value },
}

impl QuestionContent {
    pub fn from_value(raw: Value) -> Self {
        let tag = raw.get("type").and_then(Value::as_str).map(str::to_owned);
        let question_type = tag
            .as_deref()
            .map(QuestionType::from_tag)
            .unwrap_or(QuestionType::Unknown);
        let parsed = match question_type {
            QuestionType::Quiz => serde_json::from_value(raw.clone()).map(QuestionContent::Quiz),
            QuestionType::MultipleSelectQuiz => {
                serde_json::from_value(raw.clone()).map(QuestionContent::MultipleSelectQuiz)
            }
            QuestionType::Slider => {
                serde_json::from_value(raw.clone()).map(QuestionContent::Slider)
            }
            QuestionType::OpenEnded => {
                serde_json::from_value(raw.clone()).map(QuestionContent::OpenEnded)
            }
            QuestionType::Jumble => {
                serde_json::from_value(raw.clone()).map(QuestionContent::Jumble)
            }
            QuestionType::Unknown => return QuestionContent::Unknown { tag, raw },
        };
        parsed.unwrap_or(QuestionContent::Unknown { tag, raw })
    }

    pub fn question_type(&self) -> QuestionType {
        match self {
            QuestionContent::Quiz(_) => QuestionType::Quiz,
            QuestionContent::MultipleSelectQuiz(_) => QuestionType::MultipleSelectQuiz,
            QuestionContent::Slider(_) => QuestionType::Slider,
            QuestionContent::OpenEnded(_) => QuestionType::OpenEnded,
            QuestionContent::Jumble(_) => QuestionType::Jumble,
            QuestionContent::Unknown { .. } => QuestionType::Unknown,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            QuestionContent::Quiz(q)
            | QuestionContent::MultipleSelectQuiz(q)
            | QuestionContent::Jumble(q) => q.title.as_deref(),
            QuestionContent::Slider(q) => q.title.as_deref(),
            QuestionContent::OpenEnded(q) => q.title.as_deref(),
            QuestionContent::Unknown { raw, .. } => raw.get("title").and_then(Value::as_str),
        }
    }

    pub fn time_available(&self) -> Option<u64> {
        match self {
            QuestionContent::Quiz(q)
            | QuestionContent::MultipleSelectQuiz(q)
            | QuestionContent::Jumble(q) => q.time_available,
            QuestionContent::Slider(q) => q.time_available,
            QuestionContent::OpenEnded(q) => q.time_available,
            QuestionContent::Unknown { raw, .. } => {
                raw.get("timeAvailable").and_then(Value::as_u64)
            }
        }
    }

    pub fn number_of_choices(&self) -> Option<u32> {
        match self {
            QuestionContent::Quiz(q)
            | QuestionContent::MultipleSelectQuiz(q)
            | QuestionContent::Jumble(q) => q.number_of_choices,
            _ => None,
        }
    }
}
