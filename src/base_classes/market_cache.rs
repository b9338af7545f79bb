//! Read API over the shared market state.
//!
//! A read inside the class TTL is served from memory with no network I/O.
//! Anything older goes through the refresh client synchronously; if that
//! fails the caller still gets the old value flagged as stale, and only a key
//! that was never populated reads as degraded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::base_classes::bar::Bar;
use crate::base_classes::freshness::FreshnessKey;
use crate::base_classes::order_book::OrderBook;
use crate::base_classes::refresh::RefreshClient;
use crate::base_classes::snapshots::SnapshotStore;
use crate::base_classes::state::MarketState;
use crate::base_classes::tickers::{FundingInfo, OpenInterest, Ticker24h};
use crate::base_classes::types::{DataClass, Interval};

#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead<T> {
    Fresh(T),
    /// Refresh failed; `value` is the last good copy, `age` its age.
    Stale { value: T, age: Duration },
    /// Never populated and the refresh failed.
    Degraded,
}

impl<T> CacheRead<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            CacheRead::Fresh(v) | CacheRead::Stale { value: v, .. } => Some(v),
            CacheRead::Degraded => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CacheRead::Fresh(v) | CacheRead::Stale { value: v, .. } => Some(v),
            CacheRead::Degraded => None,
        }
    }

    #[inline]
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheRead::Fresh(_))
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        matches!(self, CacheRead::Stale { .. })
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        matches!(self, CacheRead::Degraded)
    }
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub klines: Duration,
    pub order_book: Duration,
    pub funding: Duration,
    pub open_interest: Duration,
    pub ticker: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            klines: Duration::from_secs(300),
            order_book: Duration::from_secs(10),
            funding: Duration::from_secs(3_600),
            open_interest: Duration::from_secs(300),
            ticker: Duration::from_secs(60),
        }
    }
}

impl CacheTtls {
    pub fn for_class(&self, class: DataClass) -> Duration {
        match class {
            DataClass::Klines => self.klines,
            DataClass::OrderBook => self.order_book,
            DataClass::Funding => self.funding,
            DataClass::OpenInterest => self.open_interest,
            DataClass::Ticker => self.ticker,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub symbols_tracked: usize,
    pub stale_reads: u64,
    pub degraded_reads: u64,
    pub rejected_bars: u64,
}

pub struct MarketDataCache {
    state: Arc<MarketState>,
    refresh: Arc<RefreshClient>,
    ttls: CacheTtls,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    degraded: AtomicU64,
}

impl MarketDataCache {
    pub fn new(refresh: Arc<RefreshClient>, ttls: CacheTtls) -> Self {
        Self {
            state: refresh.state().clone(),
            refresh,
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &Arc<MarketState> {
        &self.state
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Up to `limit` most recent bars, most recent last.
    pub async fn get_bars(&self, symbol: &str, interval: Interval, limit: usize) -> CacheRead<Vec<Bar>> {
        let key = FreshnessKey::klines(symbol, interval);
        let bars = &self.state.bars;
        if bars.is_initialized(symbol, interval)
            && self.state.freshness.is_fresh(&key, self.ttls.klines)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return CacheRead::Fresh(bars.read(symbol, interval, limit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(symbol = %key.symbol, %interval, "kline cache miss");
        match self.refresh.refresh_klines(symbol, interval).await {
            Ok(_) => CacheRead::Fresh(bars.read(symbol, interval, limit)),
            Err(_) if bars.count(symbol, interval) > 0 => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                CacheRead::Stale {
                    value: bars.read(symbol, interval, limit),
                    age: self.state.freshness.age(&key).unwrap_or_default(),
                }
            }
            Err(_) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                CacheRead::Degraded
            }
        }
    }

    pub async fn get_order_book(&self, symbol: &str) -> CacheRead<OrderBook> {
        self.read_snapshot(DataClass::OrderBook, symbol, &self.state.order_books)
            .await
    }

    pub async fn get_funding_rate(&self, symbol: &str) -> CacheRead<FundingInfo> {
        self.read_snapshot(DataClass::Funding, symbol, &self.state.funding)
            .await
    }

    pub async fn get_open_interest(&self, symbol: &str) -> CacheRead<OpenInterest> {
        self.read_snapshot(DataClass::OpenInterest, symbol, &self.state.open_interest)
            .await
    }

    pub async fn get_ticker_24h(&self, symbol: &str) -> CacheRead<Ticker24h> {
        self.read_snapshot(DataClass::Ticker, symbol, &self.state.tickers)
            .await
    }

    async fn read_snapshot<T: Clone>(
        &self,
        class: DataClass,
        symbol: &str,
        store: &SnapshotStore<T>,
    ) -> CacheRead<T> {
        let key = FreshnessKey::snapshot(class, symbol);
        if let Some(value) = store.get(symbol) {
            if self.state.freshness.is_fresh(&key, self.ttls.for_class(class)) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheRead::Fresh(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(class = %class, symbol = %key.symbol, "snapshot cache miss");
        let refreshed = self.refresh.refresh_snapshot(class, symbol).await.is_ok();
        match store.get(symbol) {
            Some(value) if refreshed => CacheRead::Fresh(value),
            Some(value) => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                CacheRead::Stale {
                    value,
                    age: self.state.freshness.age(&key).unwrap_or_default(),
                }
            }
            None => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                CacheRead::Degraded
            }
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            symbols_tracked: self.state.bars.symbols().len(),
            stale_reads: self.stale.load(Ordering::Relaxed),
            degraded_reads: self.degraded.load(Ordering::Relaxed),
            rejected_bars: self.state.bars.rejected_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_classes::refresh::RefreshConfig;
    use crate::test_support::{
        MIN, MockSource, book, funding, minute_bars, open_interest, ticker,
    };

    fn cache_with(source: Arc<MockSource>, ttls: CacheTtls) -> MarketDataCache {
        let cfg = RefreshConfig {
            bar_limit: 50,
            order_book_depth: 5,
            max_requests_per_sec: 0,
        };
        let state = Arc::new(MarketState::new(50));
        MarketDataCache::new(Arc::new(RefreshClient::new(state, source, cfg)), ttls)
    }

    fn zero_ttls() -> CacheTtls {
        CacheTtls {
            klines: Duration::ZERO,
            order_book: Duration::ZERO,
            funding: Duration::ZERO,
            open_interest: Duration::ZERO,
            ticker: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn fresh_read_makes_no_network_calls() {
        let source = Arc::new(MockSource::new());
        source.set_bars("BTCUSDT", Interval::M1, minute_bars(0, 20, 100.0));
        let cache = cache_with(source.clone(), CacheTtls::default());
        cache.refresh.bootstrap(&["BTCUSDT".to_string()], &[Interval::M1]).await;

        source.fail_all(true);
        let calls = source.calls();
        let read = cache.get_bars("BTCUSDT", Interval::M1, 5).await;
        let CacheRead::Fresh(bars) = read else {
            panic!("expected fresh read, got {read:?}");
        };
        assert_eq!(bars.len(), 5);
        assert_eq!(bars.last().unwrap().open_time, 19 * MIN);
        assert_eq!(source.calls(), calls);

        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));
        assert_eq!(stats.symbols_tracked, 1);
    }

    #[tokio::test]
    async fn expired_read_refreshes_synchronously() {
        let source = Arc::new(MockSource::new());
        source.set_bars("BTCUSDT", Interval::M1, minute_bars(0, 3, 100.0));
        let cache = cache_with(source.clone(), zero_ttls());

        let first = cache.get_bars("BTCUSDT", Interval::M1, 10).await;
        assert_eq!(first.value().map(Vec::len), Some(3));
        assert_eq!(source.calls(), 1);

        source.set_bars("BTCUSDT", Interval::M1, minute_bars(0, 4, 100.0));
        let second = cache.get_bars("BTCUSDT", Interval::M1, 10).await;
        assert!(second.is_fresh());
        assert_eq!(second.value().map(Vec::len), Some(4));
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.get_stats().misses, 2);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_copy() {
        let source = Arc::new(MockSource::new());
        source.set_bars("BTCUSDT", Interval::M1, minute_bars(0, 3, 100.0));
        let cache = cache_with(source.clone(), zero_ttls());
        cache.get_bars("BTCUSDT", Interval::M1, 10).await;

        source.fail_all(true);
        let read = cache.get_bars("BTCUSDT", Interval::M1, 2).await;
        assert!(read.is_stale(), "{read:?}");
        assert_eq!(read.into_value().unwrap().len(), 2);
        assert_eq!(cache.get_stats().stale_reads, 1);
    }

    #[tokio::test]
    async fn never_populated_and_unreachable_is_degraded() {
        let source = Arc::new(MockSource::new());
        source.fail_all(true);
        let cache = cache_with(source.clone(), CacheTtls::default());

        assert!(cache.get_bars("BTCUSDT", Interval::M1, 10).await.is_degraded());
        assert!(cache.get_funding_rate("BTCUSDT").await.is_degraded());
        assert!(cache.get_order_book("BTCUSDT").await.is_degraded());
        let stats = cache.get_stats();
        assert_eq!(stats.degraded_reads, 3);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn snapshot_reads_hit_within_ttl() {
        let source = Arc::new(MockSource::new());
        source.set_funding(funding("BTCUSDT", 0.0001));
        source.set_order_book(book("BTCUSDT", 99.0, 101.0));
        let cache = cache_with(source.clone(), CacheTtls::default());

        assert!(cache.get_funding_rate("BTCUSDT").await.is_fresh());
        assert!(cache.get_funding_rate("btc_usdt").await.is_fresh());
        let book = cache.get_order_book("BTCUSDT").await.into_value().unwrap();
        assert_eq!(book.mid_price(), Some(100.0));
        assert_eq!(source.calls(), 2);

        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unreachable_snapshot_falls_back_to_last_value() {
        let source = Arc::new(MockSource::new());
        source.set_funding(funding("ETHUSDT", 0.0003));
        let cache = cache_with(source.clone(), zero_ttls());
        assert!(cache.get_funding_rate("ETHUSDT").await.is_fresh());

        source.fail_all(true);
        match cache.get_funding_rate("ETHUSDT").await {
            CacheRead::Stale { value, .. } => assert_eq!(value.funding_rate, 0.0003),
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(cache.get_open_interest("ETHUSDT").await.is_degraded());
        assert!(cache.get_ticker_24h("ETHUSDT").await.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttls_expire_on_their_boundaries() {
        let source = Arc::new(MockSource::new());
        source.set_bars("BTCUSDT", Interval::M1, minute_bars(0, 5, 100.0));
        source.set_order_book(book("BTCUSDT", 99.0, 101.0));
        source.set_funding(funding("BTCUSDT", 0.0001));
        let cache = cache_with(source.clone(), CacheTtls::default());
        cache.refresh.bootstrap(&["BTCUSDT".to_string()], &[Interval::M1]).await;
        assert!(cache.get_order_book("BTCUSDT").await.is_fresh());
        assert!(cache.get_funding_rate("BTCUSDT").await.is_fresh());
        assert_eq!(source.calls(), 3);

        // Order book: 10s.
        tokio::time::advance(Duration::from_millis(9_999)).await;
        cache.get_order_book("BTCUSDT").await;
        assert_eq!(source.calls(), 3);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get_order_book("BTCUSDT").await.is_fresh());
        assert_eq!(source.calls(), 4);

        // Klines: 300s since bootstrap.
        tokio::time::advance(Duration::from_secs(289)).await;
        assert!(cache.get_bars("BTCUSDT", Interval::M1, 5).await.is_fresh());
        assert_eq!(source.calls(), 4);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get_bars("BTCUSDT", Interval::M1, 5).await.is_fresh());
        assert_eq!(source.calls(), 5);

        // Funding: 3600s since its first fetch.
        tokio::time::advance(Duration::from_secs(3_299)).await;
        cache.get_funding_rate("BTCUSDT").await;
        assert_eq!(source.calls(), 5);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get_funding_rate("BTCUSDT").await;
        assert_eq!(source.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn open_interest_hits_then_refreshes_then_goes_stale() {
        let source = Arc::new(MockSource::new());
        source.set_open_interest(open_interest("SOLUSDT", 1_000.0));
        let cache = cache_with(source.clone(), CacheTtls::default());

        assert!(cache.get_open_interest("SOLUSDT").await.is_fresh());
        tokio::time::advance(Duration::from_secs(299)).await;
        let hit = cache.get_open_interest("SOLUSDT").await;
        assert_eq!(hit.into_value().unwrap().open_interest, 1_000.0);
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        source.set_open_interest(open_interest("SOLUSDT", 1_500.0));
        let refreshed = cache.get_open_interest("SOLUSDT").await;
        assert!(refreshed.is_fresh());
        assert_eq!(refreshed.into_value().unwrap().open_interest, 1_500.0);
        assert_eq!(source.calls(), 2);

        tokio::time::advance(Duration::from_secs(300)).await;
        source.fail_all(true);
        match cache.get_open_interest("SOLUSDT").await {
            CacheRead::Stale { value, age } => {
                assert_eq!(value.open_interest, 1_500.0);
                assert_eq!(age, Duration::from_secs(300));
            }
            other => panic!("expected stale, got {other:?}"),
        }
        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses, stats.stale_reads), (1, 3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_hits_then_refreshes_then_goes_stale() {
        let source = Arc::new(MockSource::new());
        source.set_ticker(ticker("ETHUSDT", 3_000.0));
        let cache = cache_with(source.clone(), CacheTtls::default());

        assert!(cache.get_ticker_24h("ETHUSDT").await.is_fresh());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get_ticker_24h("ETHUSDT").await.is_fresh());
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        source.set_ticker(ticker("ETHUSDT", 3_100.0));
        let refreshed = cache.get_ticker_24h("ETHUSDT").await;
        assert_eq!(refreshed.into_value().unwrap().last_price, 3_100.0);
        assert_eq!(source.calls(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        source.fail_all(true);
        let stale = cache.get_ticker_24h("ETHUSDT").await;
        assert!(stale.is_stale(), "{stale:?}");
        assert_eq!(stale.into_value().unwrap().last_price, 3_100.0);
        assert_eq!(cache.get_stats().hits, 1);
    }
}
