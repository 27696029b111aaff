//! Fan-out bridge: per-stream log → WebSocket rooms.
//!
//! Consumes the trades and bars streams through a durable consumer group
//! and routes each entry to the per-symbol room (and optionally the global
//! broadcast). Entries are acked only after dispatch, so a crash leaves
//! them pending; the pending list is drained on startup before new reads.

use crate::client::ClientRegistry;
use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::rooms::room_for_ticker;
use metrics::counter;
use std::sync::Arc;
use stream_log::{LogEntry, StreamLogClient, BARS_STREAM, GATEWAY_CONSUMER_GROUP, TRADES_STREAM};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the fan-out bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Consumer name within the gateway consumer group.
    pub consumer_name: String,
    /// Also emit every event to the global broadcast.
    pub broadcast_global: bool,
    /// Blocking read timeout in milliseconds.
    pub block_ms: usize,
    /// Max entries per read.
    pub read_count: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            consumer_name: stream_log::DEFAULT_CONSUMER_NAME.to_string(),
            broadcast_global: false,
            block_ms: 2_000,
            read_count: 128,
        }
    }
}

/// Routes per-stream log entries to subscribed WebSocket clients.
pub struct FanoutBridge {
    log: StreamLogClient,
    registry: Arc<ClientRegistry>,
    config: BridgeConfig,
}

impl FanoutBridge {
    pub fn new(log: StreamLogClient, registry: Arc<ClientRegistry>, config: BridgeConfig) -> Self {
        Self {
            log,
            registry,
            config,
        }
    }

    /// Run the bridge until shutdown.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let streams = [TRADES_STREAM, BARS_STREAM];
        for stream in streams {
            self.log.ensure_group(stream, GATEWAY_CONSUMER_GROUP).await?;
        }

        self.drain_pending(&streams).await?;

        info!(
            "fanout bridge running as '{}' in group '{}'",
            self.config.consumer_name, GATEWAY_CONSUMER_GROUP
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("fanout bridge received shutdown");
                    break;
                }

                read = self.log.read_group(
                    &streams,
                    GATEWAY_CONSUMER_GROUP,
                    &self.config.consumer_name,
                    self.config.block_ms,
                    self.config.read_count,
                    false,
                ) => {
                    match read {
                        Ok(entries) => {
                            for entry in entries {
                                self.dispatch_and_ack(entry).await;
                            }
                        }
                        Err(e) => {
                            warn!("log read failed: {e}");
                            counter!("bridge_read_errors_total").increment(1);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!("fanout bridge stopped");
        Ok(())
    }

    /// Re-dispatch entries this consumer read but never acked.
    async fn drain_pending(&self, streams: &[&str]) -> Result<()> {
        loop {
            let entries = self
                .log
                .read_group(
                    streams,
                    GATEWAY_CONSUMER_GROUP,
                    &self.config.consumer_name,
                    0,
                    self.config.read_count,
                    true,
                )
                .await?;
            if entries.is_empty() {
                return Ok(());
            }
            info!("draining {} pending log entries", entries.len());
            for entry in entries {
                self.dispatch_and_ack(entry).await;
            }
        }
    }

    /// Dispatch one entry. Malformed entries are acked and dropped;
    /// dispatch failures leave the entry pending for retry.
    async fn dispatch_and_ack(&self, entry: LogEntry) {
        let stream = entry.stream.clone();
        let id = entry.id.clone();

        match self.dispatch(entry) {
            Ok(()) => {
                counter!("bridge_dispatched_total", "stream" => stream.clone()).increment(1);
                self.ack(&stream, &id).await;
            }
            Err(DispatchError::Malformed(reason)) => {
                warn!("dropping malformed log entry {id} on {stream}: {reason}");
                counter!("bridge_malformed_total", "stream" => stream.clone()).increment(1);
                self.ack(&stream, &id).await;
            }
            Err(DispatchError::Broadcast(e)) => {
                warn!("broadcast failed for entry {id} on {stream}, leaving pending: {e}");
                counter!("bridge_dispatch_errors_total", "stream" => stream.clone()).increment(1);
            }
        }
    }

    fn dispatch(&self, entry: LogEntry) -> std::result::Result<(), DispatchError> {
        if entry.symbol.trim().is_empty() {
            return Err(DispatchError::Malformed("empty symbol".to_string()));
        }
        let data: serde_json::Value = serde_json::from_str(&entry.data)
            .map_err(|e| DispatchError::Malformed(e.to_string()))?;
        if !data.is_object() {
            return Err(DispatchError::Malformed("data is not an object".to_string()));
        }

        let msg = if entry.stream == BARS_STREAM {
            ServerMessage::BarUpdate { data }
        } else {
            ServerMessage::TradeUpdate { data }
        };

        let room = room_for_ticker(&entry.symbol.trim().to_uppercase());
        let delivered = self
            .registry
            .broadcast_to_room(&room, &msg)
            .map_err(|e| DispatchError::Broadcast(e.to_string()))?;
        debug!("dispatched {} entry for {} to {delivered} clients", entry.stream, entry.symbol);

        if self.config.broadcast_global {
            self.registry
                .broadcast(&msg)
                .map_err(|e| DispatchError::Broadcast(e.to_string()))?;
        }
        Ok(())
    }

    async fn ack(&self, stream: &str, id: &str) {
        if let Err(e) = self.log.ack(stream, GATEWAY_CONSUMER_GROUP, id).await {
            warn!("ack failed for {id} on {stream}: {e}");
        }
    }
}

enum DispatchError {
    Malformed(String),
    Broadcast(String),
}
