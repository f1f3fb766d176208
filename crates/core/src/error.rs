//! Error types for tether-core

use thiserror::Error;

use crate::types::HeartbeatError;

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid server URI: {0}")]
    InvalidUri(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Certificate parse error: {0}")]
    CertParseError(String),

    #[error("Heartbeat failed: {0}")]
    Heartbeat(#[from] HeartbeatError),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport is closed")]
    Closed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<url::ParseError> for CoreError {
    fn from(err: url::ParseError) -> Self {
        CoreError::InvalidUri(err.to_string())
    }
}

impl From<rustls::Error> for CoreError {
    fn from(err: rustls::Error) -> Self {
        CoreError::Tls(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(io) => CoreError::Io(io),
            WsError::ConnectionClosed | WsError::AlreadyClosed => CoreError::NotConnected,
            other => CoreError::Connection(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Http(err.to_string())
    }
}
