//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Per-stream log error.
    #[error("log error: {0}")]
    Log(#[from] stream_log::LogError),

    /// HTTP client error (proxy).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Client not found in the registry.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Invalid ticker in a subscribe/unsubscribe payload.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Client send queue overflowed; the connection is dropped.
    #[error("send queue full")]
    SendQueueFull,

    /// Client channel closed.
    #[error("channel send error")]
    ChannelSend,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
