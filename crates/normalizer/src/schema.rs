//! Normalized market-data schema shared across the pipeline.
//!
//! These are the shapes that travel on the bus, land in the relational
//! store, and are republished to the per-stream log for fan-out.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default bar timeframe.
pub const DEFAULT_TIMEFRAME: &str = "1m";

fn default_timeframe() -> String {
    DEFAULT_TIMEFRAME.to_string()
}

/// A single normalized trade observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeMessage {
    /// Upper-case ticker.
    pub symbol: String,
    /// Trade price, strictly positive.
    pub price: Decimal,
    /// Trade size, non-negative (zero-size trades occur on some feeds).
    pub size: Decimal,
    /// Epoch milliseconds, monotonic per symbol only.
    pub timestamp: i64,
}

impl TradeMessage {
    /// Idempotency key under which the store suppresses duplicates.
    pub fn idempotency_key(&self) -> (String, i64, Decimal, Decimal) {
        (self.symbol.clone(), self.timestamp, self.price, self.size)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("empty symbol".to_string());
        }
        if self.price <= Decimal::ZERO {
            return Err(format!("non-positive price {}", self.price));
        }
        if self.size < Decimal::ZERO {
            return Err(format!("negative size {}", self.size));
        }
        Ok(())
    }
}

/// A single normalized OHLC bar observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarMessage {
    /// Upper-case ticker.
    pub symbol: String,
    /// Bar timeframe (e.g. "1m").
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Bar close time, epoch milliseconds.
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub trade_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<Decimal>,
}

impl BarMessage {
    /// Enforce `low <= min(open, close) <= max(open, close) <= high` plus
    /// non-negative volume and trade count.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("empty symbol".to_string());
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(format!(
                "OHLC out of order: o={} h={} l={} c={}",
                self.open, self.high, self.low, self.close
            ));
        }
        if self.volume < Decimal::ZERO {
            return Err(format!("negative volume {}", self.volume));
        }
        if self.trade_count < 0 {
            return Err(format!("negative trade_count {}", self.trade_count));
        }
        Ok(())
    }
}

/// A normalized market message with its `"type"` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketMessage {
    Trade(TradeMessage),
    Bar(BarMessage),
}

impl MarketMessage {
    pub fn symbol(&self) -> &str {
        match self {
            MarketMessage::Trade(t) => &t.symbol,
            MarketMessage::Bar(b) => &b.symbol,
        }
    }

    /// Event name used on the client WebSocket surface.
    pub fn event_name(&self) -> &'static str {
        match self {
            MarketMessage::Trade(_) => "trade_update",
            MarketMessage::Bar(_) => "bar_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade() -> TradeMessage {
        TradeMessage {
            symbol: "AAPL".to_string(),
            price: dec!(150.25),
            size: dec!(100),
            timestamp: 1736937000000,
        }
    }

    #[test]
    fn trade_round_trips_with_type_tag() {
        let msg = MarketMessage::Trade(trade());
        let json = serde_json::to_string(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["timestamp"], 1736937000000i64);

        let back: MarketMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn zero_size_trade_is_valid() {
        let mut t = trade();
        t.size = Decimal::ZERO;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let mut t = trade();
        t.price = Decimal::ZERO;
        assert!(t.validate().is_err());
    }

    #[test]
    fn bar_invariant_enforced() {
        let mut bar = BarMessage {
            symbol: "MSFT".to_string(),
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            timestamp: 1736937000000,
            open: dec!(10),
            high: dec!(12),
            low: dec!(9),
            close: dec!(11),
            volume: dec!(1000),
            trade_count: 42,
            vwap: Some(dec!(10.5)),
        };
        assert!(bar.validate().is_ok());

        // high below open
        bar.high = dec!(9.5);
        assert!(bar.validate().is_err());

        bar.high = dec!(12);
        bar.low = dec!(10.5);
        assert!(bar.validate().is_err());

        bar.low = dec!(9);
        bar.volume = dec!(-1);
        assert!(bar.validate().is_err());
    }

    #[test]
    fn bar_timeframe_defaults_on_deserialize() {
        let json = r#"{"type":"bar","symbol":"GOOGL","timestamp":1736937000000,
            "open":10,"high":12,"low":9,"close":11,"volume":500}"#;
        let msg: MarketMessage = serde_json::from_str(json).unwrap();
        match msg {
            MarketMessage::Bar(b) => {
                assert_eq!(b.timeframe, "1m");
                assert_eq!(b.trade_count, 0);
                assert!(b.vwap.is_none());
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn event_names_match_wire_contract() {
        let t = MarketMessage::Trade(trade());
        assert_eq!(t.event_name(), "trade_update");
    }
}
