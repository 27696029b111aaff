//! Per-stream log client for the realtime fan-out channel.
//!
//! The log is a pair of Redis Streams, one for trades and one for bars.
//! The stream processor appends committed records; the gateway's fan-out
//! bridge consumes them through a durable consumer group with explicit
//! acks, so an entry stays pending until it has been dispatched.

use crate::error::{LogError, Result};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Stream carrying committed trade records.
pub const TRADES_STREAM: &str = "market:realtime:trades";

/// Stream carrying committed bar records.
pub const BARS_STREAM: &str = "market:realtime:bars";

/// Consumer group used by gateway instances.
pub const GATEWAY_CONSUMER_GROUP: &str = "gateway_stream_consumers";

/// Default consumer name within the gateway group.
pub const DEFAULT_CONSUMER_NAME: &str = "gateway-consumer";

/// Entry field holding the upper-case ticker.
pub const SYMBOL_FIELD: &str = "symbol";

/// Entry field holding the JSON payload.
pub const DATA_FIELD: &str = "data";

/// Connection settings for the log endpoint.
///
/// A full URL takes precedence over host/port; TLS is implied by the
/// `rediss://` scheme.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

impl LogConfig {
    /// Resolve the effective connection URL.
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// One entry read from a log stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Stream the entry came from.
    pub stream: String,
    /// Entry id (used for acking).
    pub id: String,
    /// Upper-case ticker.
    pub symbol: String,
    /// JSON payload.
    pub data: String,
}

/// Per-stream log client.
#[derive(Clone)]
pub struct StreamLogClient {
    client: Arc<redis::Client>,
}

impl StreamLogClient {
    pub fn new(config: &LogConfig) -> Result<Self> {
        let url = config.connection_url();
        let client = redis::Client::open(url.as_str())?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    // =========================================================================
    // Publication
    // =========================================================================

    /// Append an entry to a stream. Returns the assigned entry id.
    pub async fn append(&self, stream: &str, symbol: &str, data: &str) -> Result<String> {
        let mut conn = self.get_connection().await?;
        let id: String = conn
            .xadd(stream, "*", &[(SYMBOL_FIELD, symbol), (DATA_FIELD, data)])
            .await?;
        debug!("appended {symbol} to {stream} as {id}");
        Ok(id)
    }

    /// Append a committed trade record.
    pub async fn publish_trade(&self, symbol: &str, data: &str) -> Result<String> {
        self.append(TRADES_STREAM, symbol, data).await
    }

    /// Append a committed bar record.
    pub async fn publish_bar(&self, symbol: &str, data: &str) -> Result<String> {
        self.append(BARS_STREAM, symbol, data).await
    }

    // =========================================================================
    // Consumer group
    // =========================================================================

    /// Create the consumer group on a stream if it does not exist yet.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream, group, "$")
            .await;

        match created {
            Ok(()) => {
                info!("created consumer group '{group}' on {stream}");
                Ok(())
            }
            // BUSYGROUP means the group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read entries for a consumer.
    ///
    /// With `pending = false` this blocks up to `block_ms` for new entries
    /// (`>`); with `pending = true` it re-reads this consumer's pending
    /// entries from the beginning (`0`) without blocking.
    pub async fn read_group(
        &self,
        streams: &[&str],
        group: &str,
        consumer: &str,
        block_ms: usize,
        count: usize,
        pending: bool,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.get_connection().await?;

        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if !pending {
            opts = opts.block(block_ms);
        }
        let ids: Vec<&str> = streams.iter().map(|_| if pending { "0" } else { ">" }).collect();

        let reply: StreamReadReply = conn.xread_options(streams, &ids, &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for raw in key.ids {
                entries.push(parse_entry(&key.key, raw)?);
            }
        }
        Ok(entries)
    }

    /// Acknowledge a dispatched entry.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}

fn parse_entry(stream: &str, raw: redis::streams::StreamId) -> Result<LogEntry> {
    let symbol = field_str(&raw, SYMBOL_FIELD)
        .ok_or_else(|| LogError::MissingField(raw.id.clone(), SYMBOL_FIELD))?;
    let data = field_str(&raw, DATA_FIELD)
        .ok_or_else(|| LogError::MissingField(raw.id.clone(), DATA_FIELD))?;
    Ok(LogEntry {
        stream: stream.to_string(),
        id: raw.id,
        symbol,
        data,
    })
}

fn field_str(raw: &redis::streams::StreamId, field: &str) -> Option<String> {
    raw.map
        .get(field)
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::streams::StreamId;
    use redis::Value;

    #[test]
    fn stream_contract_constants() {
        assert_eq!(TRADES_STREAM, "market:realtime:trades");
        assert_eq!(BARS_STREAM, "market:realtime:bars");
        assert_eq!(GATEWAY_CONSUMER_GROUP, "gateway_stream_consumers");
        assert_eq!(DEFAULT_CONSUMER_NAME, "gateway-consumer");
    }

    #[test]
    fn url_takes_precedence_over_host_port() {
        let config = LogConfig {
            url: Some("rediss://log.internal:6380".to_string()),
            host: "ignored".to_string(),
            port: 1,
        };
        assert_eq!(config.connection_url(), "rediss://log.internal:6380");

        let config = LogConfig {
            url: None,
            host: "10.0.0.5".to_string(),
            port: 6390,
        };
        assert_eq!(config.connection_url(), "redis://10.0.0.5:6390");

        // empty URL falls back to host/port
        let config = LogConfig {
            url: Some(String::new()),
            host: "localhost".to_string(),
            port: 6379,
        };
        assert_eq!(config.connection_url(), "redis://localhost:6379");
    }

    fn raw_entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::BulkString(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn parses_entry_fields() {
        let raw = raw_entry(
            "1700000000000-0",
            &[
                ("symbol", "AAPL"),
                ("data", r#"{"type":"trade","symbol":"AAPL"}"#),
            ],
        );
        let entry = parse_entry(TRADES_STREAM, raw).unwrap();
        assert_eq!(entry.symbol, "AAPL");
        assert_eq!(entry.id, "1700000000000-0");
        assert!(entry.data.contains("\"type\":\"trade\""));
    }

    #[test]
    fn missing_field_is_an_error() {
        let raw = raw_entry("1-0", &[("symbol", "AAPL")]);
        assert!(matches!(
            parse_entry(TRADES_STREAM, raw),
            Err(LogError::MissingField(_, DATA_FIELD))
        ));
    }
}
