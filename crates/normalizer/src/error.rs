//! Normalization error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizerError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

pub type Result<T> = std::result::Result<T, NormalizerError>;
