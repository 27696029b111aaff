//! WebSocket gateway for realtime market-data fan-out.
//!
//! This service:
//! - Accepts client WebSocket connections and manages per-symbol rooms
//! - Consumes the per-stream log via a durable consumer group
//! - Broadcasts `trade_update` / `bar_update` events with minimal latency
//! - Proxies the read-only market REST API
//!
//! ## Architecture
//!
//! ```text
//! log: market:realtime:{trades,bars}
//!         ↓
//! FanoutBridge (consumer group, ack-after-dispatch)
//!         ↓
//! ClientRegistry (rooms: symbol:<TICKER>)
//!         ↓
//! WebSocket clients
//! ```
//!
//! A mock feed (`MOCK_REALTIME=true`) can stand in for the bridge during
//! development; the two never run together on one instance.

pub mod bridge;
pub mod client;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod proxy;
pub mod rooms;
pub mod ws_server;

pub use bridge::{BridgeConfig, FanoutBridge};
pub use client::{ClientId, ClientRegistry, ClientState, SEND_QUEUE_LIMIT};
pub use error::{GatewayError, Result};
pub use mock::MockFeed;
pub use protocol::{ClientMessage, ServerMessage, SymbolPayload};
pub use proxy::ProxyState;
pub use rooms::{normalize_ticker, room_for_ticker, ROOM_PREFIX};
pub use ws_server::{create_router, AppState};
