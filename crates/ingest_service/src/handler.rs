//! Upstream feed handler.
//!
//! Implements [`WsHandler`] for the market-data feed: authenticates on
//! connect, subscribes once authentication is confirmed, and forwards
//! normalized trades and bars to the bus. Publication is fire-and-forget;
//! durability begins at the bus.

use async_trait::async_trait;
use bytes::Bytes;
use common::{Error, Result, WsHandler};
use metrics::counter;
use nats_client::{bar_subject, trade_subject, NatsClient};
use normalizer::{
    build_auth_message, build_subscribe_message, parse_frames, BarMessage, ControlFrame,
    MarketMessage, TradeMessage, UpstreamFrame,
};
use tracing::{debug, info, warn};

pub struct UpstreamHandler {
    url: String,
    key: String,
    secret: String,
    symbols: Vec<String>,
    nats: NatsClient,
}

impl UpstreamHandler {
    pub fn new(
        url: String,
        key: String,
        secret: String,
        symbols: Vec<String>,
        nats: NatsClient,
    ) -> Self {
        Self {
            url,
            key,
            secret,
            symbols,
            nats,
        }
    }

    async fn publish_trade(&self, trade: TradeMessage) {
        let subject = trade_subject(&trade.symbol);
        self.publish(subject, MarketMessage::Trade(trade), "trade").await;
    }

    async fn publish_bar(&self, bar: BarMessage) {
        let subject = bar_subject(&bar.symbol);
        self.publish(subject, MarketMessage::Bar(bar), "bar").await;
    }

    async fn publish(&self, subject: String, message: MarketMessage, kind: &'static str) {
        let payload = match serde_json::to_vec(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize {kind}: {e}");
                return;
            }
        };

        // Publish failure drops the message; the feed keeps flowing.
        match self.nats.publish(subject, Bytes::from(payload)).await {
            Ok(()) => {
                counter!("ingest_published_total", "kind" => kind).increment(1);
            }
            Err(e) => {
                warn!("bus publish failed for {kind} {}: {e}", message.symbol());
                counter!("ingest_publish_errors_total", "kind" => kind).increment(1);
            }
        }
    }
}

#[async_trait]
impl WsHandler for UpstreamHandler {
    fn url(&self) -> &str {
        &self.url
    }

    fn on_connect_message(&self) -> Option<String> {
        Some(build_auth_message(&self.key, &self.secret))
    }

    async fn on_message(&self, msg: &str) -> Result<Option<String>> {
        let frames = match parse_frames(msg) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("dropping malformed feed payload: {e}");
                counter!("ingest_malformed_payloads_total").increment(1);
                return Ok(None);
            }
        };

        let mut reply = None;
        for frame in frames {
            match frame {
                UpstreamFrame::Trade(trade) => self.publish_trade(trade).await,
                UpstreamFrame::Bar(bar) => self.publish_bar(bar).await,
                UpstreamFrame::Control(ControlFrame::Authenticated) => {
                    info!("feed authenticated, subscribing to {:?}", self.symbols);
                    reply = Some(build_subscribe_message(&self.symbols));
                }
                UpstreamFrame::Control(ControlFrame::Subscription) => {
                    info!("feed subscription confirmed");
                }
                UpstreamFrame::Control(ControlFrame::Success(msg)) => {
                    debug!("feed control: {msg}");
                }
                UpstreamFrame::Control(control @ ControlFrame::Error { .. }) => {
                    if control.is_auth_failure() {
                        return Err(Error::AuthenticationFailed(format!("{control:?}")));
                    }
                    warn!("feed error frame: {control:?}");
                }
                UpstreamFrame::Unknown(kind) => {
                    debug!("dropping unknown frame kind '{kind}'");
                    counter!("ingest_unknown_frames_total").increment(1);
                }
            }
        }
        Ok(reply)
    }

    async fn on_disconnect(&self) {
        warn!("feed connection lost, subscription state retained for reconnect");
    }
}

/// Parse a comma-separated symbol list into canonical upper-case tickers.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    symbols.dedup();
    symbols
}
