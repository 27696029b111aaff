//! Relational store for the market schema (symbols, trades, bars).

pub mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{
    ts_from_millis, url_from_parts, BarRow, MarketStore, StoreConfig, TradeRow, VolumeSeed,
};
