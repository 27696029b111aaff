//! Store error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("invalid timestamp: {0} ms")]
    InvalidTimestamp(i64),

    #[error("transaction exceeded its time budget")]
    TransactionTimeout,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
