//! Stream service entry point.
//!
//! Consumes the bus topics, persists trades and bars idempotently in
//! batches, and republishes committed records to the per-stream log.

mod persist;
mod volume;

use anyhow::Result;
use market_store::{MarketStore, StoreConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{NatsClient, BARS_GROUP, BARS_TOPIC, TRADES_GROUP, TRADES_TOPIC};
use persist::{BatchConfig, PersistLoop};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use stream_log::{LogConfig, StreamLogClient};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting stream service");

    let bus_brokers = env::var("BUS_BROKERS").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let batch_size: usize = env::var("BATCH_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()?;
    let flush_interval_ms: u64 = env::var("FLUSH_INTERVAL_MS")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()?;
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9092".to_string())
        .parse()?;

    let log_config = LogConfig {
        url: env::var("LOG_URL").ok(),
        host: env::var("LOG_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("LOG_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse()?,
    };
    let store_config = StoreConfig::from_env();

    info!("Configuration:");
    info!("  BUS_BROKERS: {bus_brokers}");
    info!("  BATCH_SIZE: {batch_size}");
    info!("  FLUSH_INTERVAL_MS: {flush_interval_ms}");
    info!("  LOG endpoint: {}", log_config.connection_url());
    info!("  METRICS_PORT: {metrics_port}");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;

    let store = Arc::new(MarketStore::connect(&store_config).await?);
    let log = StreamLogClient::new(&log_config)?;

    let nats = NatsClient::connect(&bus_brokers).await?;
    let trades_stream = nats.ensure_trades_stream().await?;
    let bars_stream = nats.ensure_bars_stream().await?;
    let trades_consumer = nats.durable_consumer(&trades_stream, TRADES_GROUP).await?;
    let bars_consumer = nats.durable_consumer(&bars_stream, BARS_GROUP).await?;

    let batch_config = BatchConfig {
        batch_size,
        flush_interval: Duration::from_millis(flush_interval_ms),
    };

    let trades_loop = PersistLoop::new(
        TRADES_TOPIC,
        trades_consumer,
        store.clone(),
        log.clone(),
        batch_config.clone(),
    );
    let bars_loop = PersistLoop::new(
        BARS_TOPIC,
        bars_consumer,
        store.clone(),
        log.clone(),
        batch_config,
    );

    let (trades_shutdown_tx, trades_shutdown_rx) = mpsc::channel(1);
    let (bars_shutdown_tx, bars_shutdown_rx) = mpsc::channel(1);

    let trades_handle = tokio::spawn(trades_loop.run(trades_shutdown_rx));
    let bars_handle = tokio::spawn(bars_loop.run(bars_shutdown_rx));

    shutdown_signal().await;
    info!("Shutting down stream service...");
    let _ = trades_shutdown_tx.send(()).await;
    let _ = bars_shutdown_tx.send(()).await;

    // Drain in-flight batches with a deadline; unacked work redelivers.
    let drain = async {
        let _ = trades_handle.await;
        let _ = bars_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(15), drain).await.is_err() {
        error!("Persist loops did not stop within drain deadline");
    }

    info!("Stream service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
