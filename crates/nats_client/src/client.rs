//! Durable bus client built on NATS JetStream.
//!
//! The bus carries two topics, one for trades and one for bars. Messages
//! are keyed by ticker: the key becomes the final subject token, so
//! per-ticker FIFO ordering holds end-to-end through a durable consumer.

use anyhow::Result;
use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, consumer::PullConsumer,
    stream::Stream};
use async_nats::Client;
use std::time::Duration;
use tracing::info;

/// Realtime trade topic.
pub const TRADES_TOPIC: &str = "stock_trades_realtime";

/// Realtime bar topic (staging).
pub const BARS_TOPIC: &str = "stock_bars_staging";

/// Consumer group persisting trades.
pub const TRADES_GROUP: &str = "trades-persist";

/// Consumer group persisting bars.
pub const BARS_GROUP: &str = "bars-persist";

/// Default retention period for bus streams (1 hour).
pub const DEFAULT_RETENTION_SECS: u64 = 3600;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Subject for a trade message keyed by ticker.
pub fn trade_subject(ticker: &str) -> String {
    format!("{TRADES_TOPIC}.{ticker}")
}

/// Subject for a bar message keyed by ticker.
pub fn bar_subject(ticker: &str) -> String {
    format!("{BARS_TOPIC}.{ticker}")
}

/// Configuration for provisioning a bus stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns captured by the stream.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Stream config for a topic. The stream is named after the topic
    /// upper-cased and captures `{topic}.>` (all ticker keys).
    pub fn for_topic(topic: &str) -> Self {
        Self {
            name: topic.to_uppercase(),
            subjects: vec![format!("{topic}.>")],
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

/// Wrapper around the NATS client with a JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to the bus. `servers` accepts a comma-separated endpoint list.
    pub async fn connect(servers: &str) -> Result<Self> {
        info!("Connecting to bus at {servers}");
        let client = async_nats::connect(servers).await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Provision the trades topic stream.
    pub async fn ensure_trades_stream(&self) -> Result<Stream> {
        self.ensure_stream(&StreamConfig::for_topic(TRADES_TOPIC)).await
    }

    /// Provision the bars topic stream.
    pub async fn ensure_bars_stream(&self) -> Result<Stream> {
        self.ensure_stream(&StreamConfig::for_topic(BARS_TOPIC)).await
    }

    /// Create or get a durable pull consumer (consumer group) on a stream.
    /// Acks are explicit; offsets advance only when the consumer acks.
    pub async fn durable_consumer(&self, stream: &Stream, group: &str) -> Result<PullConsumer> {
        let consumer = stream
            .get_or_create_consumer(
                group,
                PullConfig {
                    durable_name: Some(group.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await?;
        info!("Durable consumer '{group}' ready");
        Ok(consumer)
    }

    /// Publish a message to the bus with a JetStream acknowledgment.
    pub async fn publish(&self, subject: impl Into<String>, payload: bytes::Bytes) -> Result<()> {
        self.jetstream
            .publish(subject.into(), payload)
            .await?
            .await?;
        Ok(())
    }

    /// Publish using NATS Core (fire-and-forget, no durability).
    pub async fn publish_fast(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// The underlying JetStream context.
    pub fn context(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_keyed_by_ticker() {
        assert_eq!(trade_subject("AAPL"), "stock_trades_realtime.AAPL");
        assert_eq!(bar_subject("MSFT"), "stock_bars_staging.MSFT");
    }

    #[test]
    fn topic_stream_config_captures_all_keys() {
        let config = StreamConfig::for_topic(TRADES_TOPIC);
        assert_eq!(config.name, "STOCK_TRADES_REALTIME");
        assert_eq!(config.subjects, vec!["stock_trades_realtime.>".to_string()]);
    }
}
