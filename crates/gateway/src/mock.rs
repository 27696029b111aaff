//! Mock realtime feed for development without an upstream connection.
//!
//! Emits plausible trade and bar events over the gateway's broadcast
//! surface at a fixed cadence. Selected by configuration in `main`; never
//! runs alongside a live fan-out bridge on the same instance.

use crate::client::ClientRegistry;
use crate::protocol::ServerMessage;
use crate::rooms::room_for_ticker;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Tickers the mock feed cycles through.
const MOCK_SYMBOLS: &[&str] = &["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"];

/// Synthetic event generator sharing the gateway broadcast surface.
pub struct MockFeed {
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl MockFeed {
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Emit one trade and one bar per tick until shutdown.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "mock feed running: {} symbols every {:?}",
            MOCK_SYMBOLS.len(),
            self.interval
        );

        let mut rng = StdRng::from_entropy();
        let mut prices: HashMap<&str, f64> = MOCK_SYMBOLS
            .iter()
            .map(|s| (*s, rng.gen_range(50.0..500.0)))
            .collect();

        let mut ticker_interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("mock feed received shutdown");
                    return;
                }

                _ = ticker_interval.tick() => {
                    let symbol = MOCK_SYMBOLS[rng.gen_range(0..MOCK_SYMBOLS.len())];
                    let price = prices.get_mut(symbol).expect("symbol seeded");
                    self.emit(symbol, price, &mut rng);
                }
            }
        }
    }

    fn emit(&self, symbol: &str, price: &mut f64, rng: &mut StdRng) {
        // bounded random walk
        let drift = 1.0 + rng.gen_range(-0.005..0.005);
        *price = (*price * drift).max(1.0);
        let last = round2(*price);

        let now_ms = Utc::now().timestamp_millis();
        let size = rng.gen_range(1..500);

        let trade = ServerMessage::TradeUpdate {
            data: json!({
                "type": "trade",
                "symbol": symbol,
                "price": last,
                "size": size,
                "timestamp": now_ms,
            }),
        };

        let open = round2(last * (1.0 + rng.gen_range(-0.002..0.002)));
        let high = round2(last.max(open) * (1.0 + rng.gen_range(0.0..0.002)));
        let low = round2(last.min(open) * (1.0 - rng.gen_range(0.0..0.002)));
        let bar = ServerMessage::BarUpdate {
            data: json!({
                "type": "bar",
                "symbol": symbol,
                "timeframe": "1m",
                "timestamp": now_ms,
                "open": open,
                "high": high,
                "low": low,
                "close": last,
                "volume": rng.gen_range(1_000..100_000),
                "trade_count": rng.gen_range(10..1_000),
                "vwap": round2((open + last) / 2.0),
            }),
        };

        let room = room_for_ticker(symbol);
        for msg in [&trade, &bar] {
            let _ = self.registry.broadcast_to_room(&room, msg);
            let _ = self.registry.broadcast(msg);
        }
        debug!("mock feed emitted trade+bar for {symbol} @ {last}");
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
