//! Handler trait for upstream feed adapters.

use crate::error::Result;
use async_trait::async_trait;

/// Trait that upstream feed adapters implement to handle WebSocket events.
/// The `WsManager` drives the connection and calls these methods.
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// WebSocket URL to connect to.
    fn url(&self) -> &str;

    /// Message to send immediately after the connection is established
    /// (e.g. an authentication payload). None if nothing should be sent.
    fn on_connect_message(&self) -> Option<String>;

    /// Called for each text message received from the feed.
    ///
    /// Returning `Ok(Some(frame))` sends `frame` back upstream. Feeds that
    /// require an auth handshake use this to emit their subscription message
    /// once authentication is confirmed.
    async fn on_message(&self, msg: &str) -> Result<Option<String>>;

    /// Called when the connection is lost, before a reconnect attempt.
    async fn on_disconnect(&self) {}

    /// Called after a connection (or reconnection) is fully established.
    async fn on_reconnect(&self) {}
}
