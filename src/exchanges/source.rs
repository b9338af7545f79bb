use async_trait::async_trait;

use crate::base_classes::bar::Bar;
use crate::base_classes::order_book::OrderBook;
use crate::base_classes::tickers::{FundingInfo, OpenInterest, Ticker24h};
use crate::base_classes::types::Interval;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("venue returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Pull-based access to venue data. Every call is idempotent and safe to retry.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Up to `limit` most recent bars, oldest first.
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Bar>, SourceError>;

    async fn fetch_funding(&self, symbol: &str) -> Result<FundingInfo, SourceError>;

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OpenInterest, SourceError>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, SourceError>;

    async fn fetch_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, SourceError>;
}
