//! In-memory market data feed for crypto perpetual futures.
//!
//! Bars arrive over one multiplexed stream connection and are seeded and
//! re-synchronised over REST. [`base_classes::market_cache::MarketDataCache`]
//! serves reads from memory while they are within their TTL, and
//! [`strategy::SignalPublisher`] gates signal publication with hysteresis.

pub mod base_classes;
pub mod collectors;
pub mod config;
pub mod exchanges;
pub mod logging;
pub mod strategy;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use base_classes::engine::MarketFeed;
pub use base_classes::market_cache::{CacheRead, CacheStats, MarketDataCache};
pub use config::{FeedConfig, load_config};
pub use strategy::{SignalLevel, SignalPublisher};
