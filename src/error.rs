//! Error types for backend access and relaying

use thiserror::Error;

/// Errors that can occur while talking to the mayara-server backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// No connection could be established to the backend
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Backend answered with a non-2xx status or a body we could not decode
    #[error("Bad response from backend: {0}")]
    BadResponse(String),

    /// Transport failure on a spoke stream
    #[error("Socket error: {0}")]
    SocketError(String),

    /// Request did not complete within the fixed deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Invalid configuration
    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Configuration values outside their allowed range
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,
    #[error("Port {0} is outside 1-65535")]
    InvalidPort(u32),
    #[error("Discovery poll interval must be at least {min}s, got {actual}s")]
    DiscoveryIntervalTooShort { min: u64, actual: u64 },
    #[error("Reconnect interval must be at least {min}s, got {actual}s")]
    ReconnectIntervalTooShort { min: u64, actual: u64 },
    #[error("Cannot read config file '{0}'")]
    Read(String),
    #[error("Cannot parse config '{0}'")]
    Parse(String),
}

impl BridgeError {
    /// Classify a reqwest failure into our taxonomy.
    pub(crate) fn from_reqwest(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout(timeout_ms)
        } else if e.is_decode() {
            BridgeError::BadResponse(e.to_string())
        } else if let Some(status) = e.status() {
            BridgeError::BadResponse(format!("HTTP {}", status))
        } else {
            BridgeError::Unreachable(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::SocketError(e.to_string())
    }
}
