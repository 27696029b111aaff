//! Durable bus client (NATS JetStream) for the realtime pipeline.

mod client;

pub use client::{
    bar_subject, trade_subject, NatsClient, StreamConfig, BARS_GROUP, BARS_TOPIC,
    DEFAULT_MAX_BYTES, DEFAULT_MAX_MESSAGES, DEFAULT_RETENTION_SECS, TRADES_GROUP, TRADES_TOPIC,
};
