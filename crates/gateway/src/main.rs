//! Gateway service entry point.
//!
//! WebSocket gateway for realtime market-data streaming to clients.

use anyhow::Result;
use gateway::{
    create_router, AppState, BridgeConfig, ClientRegistry, FanoutBridge, MockFeed, ProxyState,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_log::{LogConfig, StreamLogClient};
use tokio::net::TcpListener;
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

    info!("Starting gateway service");

    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()?;
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()?;
    let market_api_url =
        env::var("MARKET_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let cors_origins = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
    let mock_realtime = env::var("MOCK_REALTIME")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let mock_interval_ms: u64 = env::var("MOCK_INTERVAL_MS")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()?;
    let broadcast_global = env::var("BROADCAST_GLOBAL")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let consumer_name = env::var("LOG_CONSUMER_NAME")
        .unwrap_or_else(|_| stream_log::DEFAULT_CONSUMER_NAME.to_string());

    let log_config = LogConfig {
        url: env::var("LOG_URL").ok(),
        host: env::var("LOG_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("LOG_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse()?,
    };

    info!("Configuration:");
    info!("  HTTP_PORT: {http_port}");
    info!("  METRICS_PORT: {metrics_port}");
    info!("  MARKET_API_URL: {market_api_url}");
    info!("  CORS_ORIGINS: {cors_origins}");
    info!("  MOCK_REALTIME: {mock_realtime}");
    info!("  BROADCAST_GLOBAL: {broadcast_global}");
    info!("  LOG endpoint: {}", log_config.connection_url());

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;

    let registry = Arc::new(ClientRegistry::new());

    // The mock feed and the live bridge are mutually exclusive per instance.
    let (feed_shutdown_tx, feed_shutdown_rx) = mpsc::channel(1);
    let feed_handle = if mock_realtime {
        info!("mock realtime mode enabled");
        let mock = MockFeed::new(registry.clone(), Duration::from_millis(mock_interval_ms));
        tokio::spawn(async move {
            mock.run(feed_shutdown_rx).await;
            Ok::<(), anyhow::Error>(())
        })
    } else {
        let log = StreamLogClient::new(&log_config)?;
        let bridge = FanoutBridge::new(
            log,
            registry.clone(),
            BridgeConfig {
                consumer_name,
                broadcast_global,
                ..BridgeConfig::default()
            },
        );
        tokio::spawn(async move {
            if let Err(e) = bridge.run(feed_shutdown_rx).await {
                error!("fanout bridge failed: {e}");
                return Err(anyhow::Error::from(e));
            }
            Ok(())
        })
    };

    let state = Arc::new(AppState {
        registry,
        proxy: ProxyState::new(market_api_url),
    });
    let app = create_router(state, &cors_origins);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down feed task...");
    let _ = feed_shutdown_tx.send(()).await;
    if tokio::time::timeout(Duration::from_secs(15), feed_handle)
        .await
        .is_err()
    {
        error!("Feed task did not stop within drain deadline");
    }

    info!("Gateway stopped");
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
