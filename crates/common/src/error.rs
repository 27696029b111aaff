//! Error types shared by the upstream-feed connection machinery.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Read idle timeout")]
    IdleTimeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Generic error: {0}")]
    Generic(String),
}

impl Error {
    /// Fatal errors abort the reconnect loop instead of triggering backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthenticationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
