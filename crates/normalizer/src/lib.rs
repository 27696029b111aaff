//! Feed normalization: shared market-data schema and the upstream frame
//! adapter.

pub mod adapter;
pub mod error;
pub mod schema;

pub use adapter::{
    build_auth_message, build_subscribe_message, parse_frames, parse_timestamp, ControlFrame,
    UpstreamFrame,
};
pub use error::{NormalizerError, Result};
pub use schema::{BarMessage, MarketMessage, TradeMessage, DEFAULT_TIMEFRAME};
