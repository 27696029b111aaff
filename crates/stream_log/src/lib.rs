//! Per-stream log (Redis Streams) client for the fan-out channel.

mod client;
pub mod error;

pub use client::{
    LogConfig, LogEntry, StreamLogClient, BARS_STREAM, DATA_FIELD, DEFAULT_CONSUMER_NAME,
    GATEWAY_CONSUMER_GROUP, SYMBOL_FIELD, TRADES_STREAM,
};
pub use error::{LogError, Result};
