pub mod audit;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod crypto;
pub mod game;
pub mod handshake;
pub mod messages;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mocks;

pub use bootstrap::Reservation;
pub use client::Client;
pub use config::ClientConfig;
pub use crypto::{DecryptStage, TokenDecryptor};
pub use game::{Answer, BlockContext, BlockStatus, QuestionBlock, Rejection, Standing};
pub use handshake::{Handshake, HandshakeStage};
pub use session::SessionContext;
pub use transport::{Inbound, Transport};
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {scheme} (expected {expected})")]
    InvalidScheme {
        scheme: String,
        expected: &'static str,
    },
    #[error("session reservation failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("session reservation returned no {0}")]
    MissingField(&'static str),
    #[error("decryption failed at {stage} stage: {reason}")]
    Decryption { stage: DecryptStage, reason: String },
    #[error("connection to {url} failed: {source}")]
    Connection {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("handshake failed at {stage} stage")]
    Handshake { stage: HandshakeStage },
    #[error("not connected")]
    NotConnected,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Milliseconds since the unix epoch, as stamped into `timesync` and bootstrap URLs.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
