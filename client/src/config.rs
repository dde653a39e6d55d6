use quizwire_types::DEFAULT_HOST;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RESERVE_URL: &str = "https://kahoot.it";
const DEFAULT_SOCKET_URL: &str = "wss://kahoot.it";
const DEFAULT_PACKET_LOG: &str = "packet_log.jsonl";
const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_LOGIN_POLLS: usize = 10;
const DEFAULT_PHASE_POLLS: usize = 5;

/// Settings for one engine instance.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Value of the `host` field in controller packets.
    pub host: String,
    /// Base URL of the session reservation endpoint.
    pub reserve_url: String,
    /// Base URL of the CometD socket; `/cometd/<pin>/<token>` is appended.
    pub socket_url: String,
    pub heartbeat_interval: Duration,
    pub receive_timeout: Duration,
    /// Receive attempts while waiting for the login reply.
    pub login_polls: usize,
    /// Receive attempts for each post-login phase of the handshake.
    pub phase_polls: usize,
    /// Append-only packet audit log. `None` disables it.
    pub packet_log: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            reserve_url: DEFAULT_RESERVE_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS),
            login_polls: DEFAULT_LOGIN_POLLS,
            phase_polls: DEFAULT_PHASE_POLLS,
            packet_log: Some(PathBuf::from(DEFAULT_PACKET_LOG)),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `QUIZWIRE_*` environment variables. Unset or unparsable
    /// values keep the default. An empty `QUIZWIRE_PACKET_LOG` disables the audit log.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let packet_log = match std::env::var("QUIZWIRE_PACKET_LOG") {
            Ok(raw) if raw.is_empty() => None,
            Ok(raw) => Some(PathBuf::from(raw)),
            Err(_) => defaults.packet_log,
        };
        Self {
            host: read_string("QUIZWIRE_HOST", defaults.host),
            reserve_url: read_string("QUIZWIRE_RESERVE_URL", defaults.reserve_url),
            socket_url: read_string("QUIZWIRE_SOCKET_URL", defaults.socket_url),
            heartbeat_interval: Duration::from_millis(read_u64(
                "QUIZWIRE_HEARTBEAT_MS",
                DEFAULT_HEARTBEAT_MS,
            )),
            receive_timeout: Duration::from_millis(read_u64(
                "QUIZWIRE_RECEIVE_TIMEOUT_MS",
                DEFAULT_RECEIVE_TIMEOUT_MS,
            )),
            login_polls: read_usize("QUIZWIRE_LOGIN_POLLS", DEFAULT_LOGIN_POLLS),
            phase_polls: read_usize("QUIZWIRE_PHASE_POLLS", DEFAULT_PHASE_POLLS),
            packet_log,
        }
    }

    pub fn with_reserve_url(mut self, url: impl Into<String>) -> Self {
        self.reserve_url = url.into();
        self
    }

    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_poll_budgets(mut self, login_polls: usize, phase_polls: usize) -> Self {
        self.login_polls = login_polls;
        self.phase_polls = phase_polls;
        self
    }

    pub fn with_packet_log(mut self, path: Option<PathBuf>) -> Self {
        self.packet_log = path;
        self
    }
}

fn read_string(key: &str, fallback: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|raw| !raw.is_empty())
        .unwrap_or(fallback)
}

fn read_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn read_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(fallback)
}
