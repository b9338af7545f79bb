use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::base_classes::market_cache::CacheTtls;
use crate::base_classes::refresh::RefreshConfig;
use crate::base_classes::types::Interval;
use crate::base_classes::ws::TransportConfig;
use crate::exchanges::endpoints::{BinanceGet, BinanceWs};
use crate::strategy::PublisherConfig;

fn default_ws_url() -> String {
    BinanceWs::BASE.to_string()
}

fn default_rest_url() -> String {
    BinanceGet::BASE.to_string()
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::M1]
}

fn default_capacity() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct VenueConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Per-class TTLs in seconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TtlConfig {
    pub klines_secs: u64,
    pub order_book_secs: u64,
    pub funding_secs: u64,
    pub open_interest_secs: u64,
    pub ticker_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            klines_secs: 300,
            order_book_secs: 10,
            funding_secs: 3_600,
            open_interest_secs: 300,
            ticker_secs: 60,
        }
    }
}

impl TtlConfig {
    pub fn to_ttls(&self) -> CacheTtls {
        CacheTtls {
            klines: Duration::from_secs(self.klines_secs),
            order_book: Duration::from_secs(self.order_book_secs),
            funding: Duration::from_secs(self.funding_secs),
            open_interest: Duration::from_secs(self.open_interest_secs),
            ticker: Duration::from_secs(self.ticker_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportSection {
    pub heartbeat_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_streams: usize,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub resubscribe_debounce_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 5_000,
            max_streams: BinanceWs::MAX_STREAMS_PER_CONNECTION,
            connect_timeout_secs: 10,
            close_timeout_secs: 5,
            resubscribe_debounce_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RestSection {
    pub timeout_secs: u64,
    pub max_requests_per_sec: u32,
    pub order_book_depth: usize,
}

impl Default for RestSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_requests_per_sec: 10,
            order_book_depth: 20,
        }
    }
}

/// Refresh loop periods in seconds; `0` disables a loop.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RefreshSection {
    pub klines_secs: u64,
    pub funding_secs: u64,
    pub open_interest_secs: u64,
    pub ticker_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            klines_secs: 300,
            funding_secs: 3_600,
            open_interest_secs: 300,
            ticker_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub rest: RestSection,
    #[serde(default)]
    pub refresh: RefreshSection,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

impl FeedConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.buffer.capacity > 0, "buffer.capacity must be positive");
        ensure!(!self.intervals.is_empty(), "at least one interval is required");
        ensure!(self.transport.max_streams > 0, "transport.max_streams must be positive");
        let streams = self.symbols.len() * self.intervals.len();
        ensure!(
            streams <= self.transport.max_streams,
            "{} symbols x {} intervals = {streams} streams exceeds transport.max_streams ({})",
            self.symbols.len(),
            self.intervals.len(),
            self.transport.max_streams
        );
        ensure!(self.transport.heartbeat_secs > 0, "transport.heartbeat_secs must be positive");
        ensure!(self.rest.timeout_secs > 0, "rest.timeout_secs must be positive");
        self.publisher.validate()
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            base_url: self.venue.ws_url.clone(),
            heartbeat_interval: Duration::from_secs(t.heartbeat_secs),
            reconnect_delay: Duration::from_millis(t.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(t.max_reconnect_delay_ms),
            max_streams: t.max_streams,
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            close_timeout: Duration::from_secs(t.close_timeout_secs),
            resubscribe_debounce: Duration::from_millis(t.resubscribe_debounce_ms),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            bar_limit: self.buffer.capacity,
            order_book_depth: self.rest.order_book_depth,
            max_requests_per_sec: self.rest.max_requests_per_sec,
        }
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest.timeout_secs)
    }
}

pub fn parse_config(contents: &str) -> Result<FeedConfig> {
    let config: FeedConfig = serde_yaml::from_str(contents).context("invalid feed config")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FeedConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: FeedConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(config)
}
