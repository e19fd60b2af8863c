//! Error types for the customer screen core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreenError {
    /// Network-level failure talking to the order API (already made friendly).
    #[error("{0}")]
    Http(String),

    /// Order API answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Unexpected frame or payload shape on the streaming channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The streaming service refused the namespace connection (bad branch id or key).
    #[error("Connection rejected: {0}")]
    AuthRejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ScreenError>;
