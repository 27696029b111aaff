//! Upstream WebSocket connection manager.
//!
//! Owns the full connection lifecycle: TLS setup, reconnection with
//! exponential backoff, keepalive pings, and a read idle timeout. Feed
//! protocol concerns (auth, subscription, frame parsing) live in the
//! [`WsHandler`] implementation.

use crate::error::{Error, Result};
use crate::ws_handler::WsHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the WebSocket manager.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Interval between keepalive ping frames.
    pub ping_interval: Duration,
    /// Reconnect if no frame arrives within this window.
    pub read_idle_timeout: Duration,
    /// Initial delay before a reconnection attempt.
    pub reconnect_delay: Duration,
    /// Cap for the exponential reconnect backoff.
    pub max_reconnect_delay: Duration,
    /// Label for metrics (e.g. "upstream").
    pub feed_label: String,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            read_idle_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            feed_label: "upstream".to_string(),
        }
    }
}

/// WebSocket connection manager.
///
/// Reconnects forever on transient failures; fatal errors (authentication)
/// propagate out of [`run`](WsManager::run).
pub struct WsManager<H: WsHandler> {
    handler: Arc<H>,
    config: WsManagerConfig,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<H: WsHandler> WsManager<H> {
    pub fn new(handler: H, config: WsManagerConfig, shutdown_rx: mpsc::Receiver<()>) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown or a fatal error. Transient disconnects trigger
    /// reconnection with exponential backoff (doubling, capped).
    pub async fn run(mut self) -> Result<()> {
        let mut reconnect_delay = self.config.reconnect_delay;
        let mut shutdown = false;

        while !shutdown {
            match self.connect_and_read(&mut shutdown).await {
                Ok(()) => {
                    info!("feed connection closed gracefully");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    error!("fatal feed error, not reconnecting: {e}");
                    return Err(e);
                }
                Err(e) => {
                    counter!("ingest_disconnects_total", "feed" => self.config.feed_label.clone())
                        .increment(1);
                    warn!("feed disconnected: {e}, reconnecting in {reconnect_delay:?}");
                    self.handler.on_disconnect().await;

                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = self.shutdown_rx.recv() => break,
                    }
                    reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }

        gauge!("ingest_feed_connected", "feed" => self.config.feed_label.clone()).set(0.0);
        Ok(())
    }

    async fn connect_and_read(&mut self, shutdown: &mut bool) -> Result<()> {
        let url_str = self.handler.url().to_string();
        info!("connecting to feed: {url_str}");

        let tcp_stream = Self::open_tcp(&url_str).await?;
        let connector = Self::tls_connector()?;
        let (ws_stream, response) =
            client_async_tls_with_config(url_str.as_str(), tcp_stream, None, Some(connector))
                .await?;
        debug!("WebSocket handshake complete, status: {:?}", response.status());

        let (mut write, mut read) = ws_stream.split();

        gauge!("ingest_feed_connected", "feed" => self.config.feed_label.clone()).set(1.0);

        if let Some(init_msg) = self.handler.on_connect_message() {
            write.send(Message::Text(init_msg.into())).await?;
        }
        self.handler.on_reconnect().await;

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset();
        let mut last_read = Instant::now();

        loop {
            let idle_deadline = last_read + self.config.read_idle_timeout;
            tokio::select! {
                msg = read.next() => {
                    last_read = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("ingest_frames_received_total", "feed" => self.config.feed_label.clone()).increment(1);
                            match self.handler.on_message(&text).await {
                                Ok(Some(reply)) => {
                                    debug!("sending reply frame: {reply}");
                                    write.send(Message::Text(reply.into())).await?;
                                }
                                Ok(None) => {}
                                Err(e) if e.is_fatal() => return Err(e),
                                Err(e) => {
                                    error!("error handling feed frame: {e}");
                                    counter!("ingest_frame_errors_total", "feed" => self.config.feed_label.clone()).increment(1);
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("ignoring binary frame from feed");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!("feed sent close frame: {frame:?}");
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => return Err(Error::ConnectionClosed),
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    warn!("no frame from feed in {:?}, forcing reconnect", self.config.read_idle_timeout);
                    return Err(Error::IdleTimeout);
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new().into())).await?;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("feed manager received shutdown");
                    *shutdown = true;
                    let close_frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutdown".into(),
                    };
                    let _ = write.send(Message::Close(Some(close_frame))).await;
                    return Ok(());
                }
            }
        }
    }

    /// Open a TCP connection, preferring IPv4 addresses to dodge IPv6
    /// connect timeouts on dual-stack hosts.
    async fn open_tcp(url_str: &str) -> Result<TcpStream> {
        let url = Url::parse(url_str)?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("no host in feed URL".to_string()))?;
        let default_port = if url.scheme() == "ws" { 80 } else { 443 };
        let addr_str = format!("{}:{}", host, url.port().unwrap_or(default_port));

        let addrs: Vec<SocketAddr> = addr_str
            .to_socket_addrs()
            .map_err(|e| Error::Generic(format!("DNS resolution failed: {e}")))?
            .collect();
        let mut sorted: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
        sorted.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

        for addr in &sorted {
            match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => debug!("TCP connect to {addr} failed: {e}"),
                Err(_) => debug!("TCP connect to {addr} timed out"),
            }
        }
        Err(Error::Generic("all connection attempts failed".to_string()))
    }

    fn tls_connector() -> Result<Connector> {
        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Connector::Rustls(Arc::new(config)))
    }
}

/// Next delay in an exponential backoff sequence (doubling, capped).
pub fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let cap = Duration::from_secs(30);
        let mut d = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            d = next_backoff(d, cap);
            seen.push(d.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn auth_failure_is_fatal() {
        assert!(Error::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(!Error::IdleTimeout.is_fatal());
    }
}
