//! WebSocket protocol message types.
//!
//! Client frames are JSON objects tagged by `"type"`. The subscribe and
//! unsubscribe payloads are duck-typed for compatibility with existing
//! clients: either a bare ticker string or `{"symbol": "..."}`. The parse
//! boundary collapses both shapes into one canonical ticker.

use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Duck-typed symbol payload: `"AAPL"` or `{"symbol": "AAPL"}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SymbolPayload {
    Ticker(String),
    Object { symbol: String },
}

impl SymbolPayload {
    /// The raw ticker regardless of payload shape.
    pub fn ticker(&self) -> &str {
        match self {
            SymbolPayload::Ticker(t) => t,
            SymbolPayload::Object { symbol } => symbol,
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room for a symbol.
    Subscribe {
        #[serde(alias = "payload")]
        symbol: SymbolPayload,
    },
    /// Leave the room for a symbol.
    Unsubscribe {
        #[serde(alias = "payload")]
        symbol: SymbolPayload,
    },
    /// Keepalive.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting emitted once per connection.
    Connected { message: String, timestamp: String },
    /// A trade for a subscribed symbol. `data` carries the full pipeline
    /// payload unchanged (including its own `"type":"trade"`).
    TradeUpdate { data: serde_json::Value },
    /// A bar for a subscribed symbol.
    BarUpdate { data: serde_json::Value },
    /// Confirmation of a subscribe.
    Subscribed { symbol: String },
    /// Confirmation of an unsubscribe.
    Unsubscribed { symbol: String },
    /// Error frame.
    Error { message: String, code: String },
    /// Pong response to ping.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_accepts_bare_ticker() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","symbol":"AAPL"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { symbol } => assert_eq!(symbol.ticker(), "AAPL"),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_accepts_object_payload() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","symbol":{"symbol":"msft"}}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { symbol } => assert_eq!(symbol.ticker(), "msft"),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn payload_field_alias_is_accepted() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"unsubscribe","payload":"GOOGL"}"#).unwrap();
        match msg {
            ClientMessage::Unsubscribe { symbol } => assert_eq!(symbol.ticker(), "GOOGL"),
            other => panic!("expected unsubscribe, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"order","symbol":"AAPL"}"#).is_err());
    }

    #[test]
    fn update_frames_keep_payload_intact() {
        let data = json!({
            "type": "trade",
            "symbol": "AAPL",
            "price": 150.25,
            "size": 100,
            "timestamp": 1736937000000i64
        });
        let frame = ServerMessage::TradeUpdate { data: data.clone() };
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "trade_update");
        assert_eq!(value["data"], data);
    }

    #[test]
    fn connected_frame_shape() {
        let frame = ServerMessage::Connected {
            message: "connected to realtime market data".to_string(),
            timestamp: "2025-01-15T10:30:00Z".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "connected");
        assert!(value["message"].is_string());
        assert!(value["timestamp"].is_string());
    }
}
