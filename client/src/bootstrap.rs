use crate::{now_ms, Error, Result};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

pub const SESSION_TOKEN_HEADER: &str = "x-kahoot-session-token";

/// Encrypted socket token and the challenge needed to decrypt it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub session_token: String,
    pub challenge: String,
}

fn reservation_url(reserve_url: &str, pin: &str) -> Result<Url> {
    let mut url = Url::parse(&format!(
        "{}/reserve/session/{pin}/",
        reserve_url.trim_end_matches('/')
    ))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::InvalidScheme {
                scheme: scheme.to_string(),
                expected: "http or https",
            })
        }
    }
    // The timestamp query defeats intermediary caches.
    url.set_query(Some(&now_ms().to_string()));
    Ok(url)
}

/// Reserve a player slot in game `pin`.
pub async fn reserve_session(
    http: &reqwest::Client,
    reserve_url: &str,
    pin: &str,
) -> Result<Reservation> {
    let url = reservation_url(reserve_url, pin)?;
    debug!(%url, "reserving session");

    let response = http.get(url).send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::Failed(status));
    }

    let session_token = response
        .headers()
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .ok_or(Error::MissingField("session token"))?;
    let body: Value = response.json().await?;
    let challenge = body
        .get("challenge")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(Error::MissingField("challenge"))?;

    info!(pin, "session reserved");
    Ok(Reservation {
        session_token,
        challenge,
    })
}
