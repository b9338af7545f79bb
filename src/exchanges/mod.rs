//! Exchange integrations
//!
//! - `binance`: kline stream decoding and REST client (USD-M futures)
//! - `endpoints`: URL builders for stream and REST hosts
//! - `source`: the [`MarketDataSource`] seam the refresh client talks through

pub mod binance;
pub mod endpoints;
pub mod source;

pub use source::{MarketDataSource, SourceError};
