//! Per-stream log error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("entry {0} missing field: {1}")]
    MissingField(String, &'static str),
}

pub type Result<T> = std::result::Result<T, LogError>;
