//! Ingest service entry point.
//!
//! Maintains the upstream feed connection and forwards normalized trades
//! and bars to the durable bus.

mod handler;

use anyhow::{bail, Result};
use common::{WsManager, WsManagerConfig};
use handler::{parse_symbols, UpstreamHandler};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::env;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Symbols streamed when `SUBSCRIBED_SYMBOLS` is not set.
const DEFAULT_SYMBOLS: &str = "AAPL,MSFT,GOOGL";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ingest service");

    let upstream_url = env::var("UPSTREAM_WS_URL")
        .unwrap_or_else(|_| "wss://stream.data.alpaca.markets/v2/iex".to_string());
    let upstream_key = env::var("UPSTREAM_KEY").unwrap_or_default();
    let upstream_secret = env::var("UPSTREAM_SECRET").unwrap_or_default();
    if upstream_key.is_empty() || upstream_secret.is_empty() {
        bail!("UPSTREAM_KEY and UPSTREAM_SECRET must be configured");
    }

    let symbols = parse_symbols(
        &env::var("SUBSCRIBED_SYMBOLS").unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string()),
    );
    if symbols.is_empty() {
        bail!("SUBSCRIBED_SYMBOLS resolved to an empty symbol set");
    }

    let bus_brokers = env::var("BUS_BROKERS").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9091".to_string())
        .parse()?;

    info!("Configuration:");
    info!("  UPSTREAM_WS_URL: {upstream_url}");
    info!("  SUBSCRIBED_SYMBOLS: {symbols:?}");
    info!("  BUS_BROKERS: {bus_brokers}");
    info!("  METRICS_PORT: {metrics_port}");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;

    let nats = NatsClient::connect(&bus_brokers).await?;
    nats.ensure_trades_stream().await?;
    nats.ensure_bars_stream().await?;

    let handler = UpstreamHandler::new(upstream_url, upstream_key, upstream_secret, symbols, nats);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let manager = WsManager::new(
        handler,
        WsManagerConfig {
            read_idle_timeout: Duration::from_secs(30),
            ..WsManagerConfig::default()
        },
        shutdown_rx,
    );

    let mut run_handle = tokio::spawn(manager.run());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down ingest service...");
            let _ = shutdown_tx.send(()).await;
            match tokio::time::timeout(Duration::from_secs(15), run_handle).await {
                Ok(Ok(Ok(()))) => info!("Ingest service stopped"),
                Ok(Ok(Err(e))) => bail!("ingest worker failed: {e}"),
                Ok(Err(e)) => bail!("ingest worker panicked: {e}"),
                Err(_) => error!("Ingest worker did not stop within drain deadline"),
            }
        }
        res = &mut run_handle => {
            // The worker only returns on its own for unrecoverable failures.
            match res {
                Ok(Ok(())) => info!("Ingest worker exited"),
                Ok(Err(e)) => bail!("ingest worker failed: {e}"),
                Err(e) => bail!("ingest worker panicked: {e}"),
            }
        }
    }

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
