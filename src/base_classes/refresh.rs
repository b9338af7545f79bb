//! Pull side of the feed: seeds bar buffers at startup and periodically
//! re-synchronises the data classes the stream does not carry.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::base_classes::freshness::{FreshnessKey, UpdateSource};
use crate::base_classes::state::MarketState;
use crate::base_classes::types::{BarKey, DataClass, Interval};
use crate::exchanges::source::{MarketDataSource, SourceError};

/// Spaces outbound requests at least `1 / max_per_sec` apart across every
/// caller sharing the pacer.
#[derive(Debug)]
pub struct RequestPacer {
    min_gap: Duration,
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// `0` disables pacing.
    pub fn per_second(max_per_sec: u32) -> Self {
        let min_gap = if max_per_sec == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / max_per_sec
        };
        Self {
            min_gap,
            next_slot: tokio::sync::Mutex::new(None),
        }
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Waits for the next free slot. Callers are served in arrival order, so
    /// an on-demand cache miss queues behind requests a refresh pass has
    /// already issued; at the default 10/s a full pass over a few dozen
    /// symbols delays it by a few seconds at most.
    pub async fn acquire(&self) {
        if self.min_gap.is_zero() {
            return;
        }
        // Held across the sleep so waiters queue in order.
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = *next {
            if slot > now {
                tokio::time::sleep_until(slot).await;
            }
        }
        *next = Some(Instant::now() + self.min_gap);
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Bars requested per kline fetch; normally the buffer capacity.
    pub bar_limit: usize,
    pub order_book_depth: usize,
    pub max_requests_per_sec: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            bar_limit: 500,
            order_book_depth: 20,
            max_requests_per_sec: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub elapsed: Duration,
    pub succeeded: usize,
    pub failed: Vec<BarKey>,
}

/// Outcome of one pass over a data class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshPass {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct RefreshClient {
    state: Arc<MarketState>,
    source: Arc<dyn MarketDataSource>,
    pacer: RequestPacer,
    cfg: RefreshConfig,
    pending: Mutex<BTreeSet<BarKey>>,
}

impl RefreshClient {
    pub fn new(state: Arc<MarketState>, source: Arc<dyn MarketDataSource>, cfg: RefreshConfig) -> Self {
        Self {
            pacer: RequestPacer::per_second(cfg.max_requests_per_sec),
            state,
            source,
            cfg,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn state(&self) -> &Arc<MarketState> {
        &self.state
    }

    /// Keys that have never been seeded: their bootstrap (or a later retry)
    /// failed. Failed refreshes of seeded keys are not tracked here.
    pub fn pending(&self) -> Vec<BarKey> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Seeds every (symbol, interval) buffer once. Failures are reported and
    /// queued for retry; they never abort the remaining keys.
    pub async fn bootstrap(&self, symbols: &[String], intervals: &[Interval]) -> BootstrapReport {
        let started = Instant::now();
        let mut succeeded = 0;
        let mut failed = Vec::new();
        for symbol in symbols {
            for &interval in intervals {
                match self.refresh_klines(symbol, interval).await {
                    Ok(_) => succeeded += 1,
                    Err(_) => failed.push(BarKey::new(symbol, interval)),
                }
            }
        }
        let report = BootstrapReport {
            elapsed: started.elapsed(),
            succeeded,
            failed,
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "bootstrap finished"
        );
        report
    }

    /// Fetches recent history for one key and merges it into the buffer.
    /// Bars older than the buffer's forming bar are skipped rather than
    /// rejected. Returns the number of bars applied.
    pub async fn refresh_klines(&self, symbol: &str, interval: Interval) -> Result<usize, SourceError> {
        let key = BarKey::new(symbol, interval);
        self.pacer.acquire().await;
        let fetched = self
            .source
            .fetch_klines(&key.symbol, interval, self.cfg.bar_limit)
            .await
            .and_then(|bars| {
                // An empty response must not create a buffer with no history.
                if bars.is_empty() && !self.state.bars.is_initialized(&key.symbol, interval) {
                    Err(SourceError::Decode("empty kline history".to_string()))
                } else {
                    Ok(bars)
                }
            });
        let bars = match fetched {
            Ok(bars) => bars,
            Err(e) => {
                warn!(key = %key, error = %e, "kline fetch failed");
                if !self.state.bars.is_initialized(&key.symbol, interval) {
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key);
                }
                return Err(e);
            }
        };

        let bars = match self.state.bars.last_open_time(&key.symbol, interval) {
            Some(last) => bars.into_iter().filter(|b| b.open_time >= last).collect(),
            None => bars,
        };
        let applied = self.state.bars.upsert_many(&key.symbol, interval, bars);
        self.state
            .freshness
            .mark(FreshnessKey::klines(&key.symbol, interval), UpdateSource::Rest);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        debug!(key = %key, applied, "klines refreshed");
        Ok(applied)
    }

    /// Refreshes one non-kline data class for `symbol`.
    pub async fn refresh_snapshot(&self, class: DataClass, symbol: &str) -> Result<(), SourceError> {
        self.pacer.acquire().await;
        let state = &self.state;
        let result = match class {
            DataClass::Funding => self
                .source
                .fetch_funding(symbol)
                .await
                .map(|v| state.funding.update(symbol, v)),
            DataClass::OpenInterest => self
                .source
                .fetch_open_interest(symbol)
                .await
                .map(|v| state.open_interest.update(symbol, v)),
            DataClass::OrderBook => self
                .source
                .fetch_order_book(symbol, self.cfg.order_book_depth)
                .await
                .map(|v| state.order_books.update(symbol, v)),
            DataClass::Ticker => self
                .source
                .fetch_ticker_24h(symbol)
                .await
                .map(|v| state.tickers.update(symbol, v)),
            DataClass::Klines => {
                return Err(SourceError::Other(
                    "klines are refreshed per interval".to_string(),
                ));
            }
        };
        match result {
            Ok(()) => {
                state
                    .freshness
                    .mark(FreshnessKey::snapshot(class, symbol), UpdateSource::Rest);
                Ok(())
            }
            Err(e) => {
                warn!(class = %class, symbol, error = %e, "snapshot fetch failed");
                Err(e)
            }
        }
    }

    /// Retries every pending bootstrap key once. Returns how many recovered.
    pub async fn retry_pending(&self) -> usize {
        let mut recovered = 0;
        for key in self.pending() {
            if self.refresh_klines(&key.symbol, key.interval).await.is_ok() {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "pending bootstrap keys recovered");
        }
        recovered
    }

    /// One pass over `class` for every symbol (and interval, for klines).
    /// Kline passes retry pending keys first.
    pub async fn refresh(&self, class: DataClass, symbols: &[String], intervals: &[Interval]) -> RefreshPass {
        let mut pass = RefreshPass::default();
        match class {
            DataClass::Klines => {
                let retried: HashSet<BarKey> = self.pending().into_iter().collect();
                let recovered = self.retry_pending().await;
                pass.succeeded += recovered;
                pass.failed += retried.len().saturating_sub(recovered);
                for symbol in symbols {
                    for &interval in intervals {
                        if retried.contains(&BarKey::new(symbol, interval)) {
                            continue;
                        }
                        match self.refresh_klines(symbol, interval).await {
                            Ok(_) => pass.succeeded += 1,
                            Err(_) => pass.failed += 1,
                        }
                    }
                }
            }
            _ => {
                for symbol in symbols {
                    match self.refresh_snapshot(class, symbol).await {
                        Ok(()) => pass.succeeded += 1,
                        Err(_) => pass.failed += 1,
                    }
                }
            }
        }
        pass
    }

    /// Sleeps `every`, runs a pass, repeats until shutdown. A zero period
    /// disables the loop.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        class: DataClass,
        every: Duration,
        symbols: Vec<String>,
        intervals: Vec<Interval>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if every.is_zero() {
            debug!(class = %class, "refresh loop disabled");
            return;
        }
        info!(class = %class, every_s = every.as_secs(), symbols = symbols.len(), "refresh loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(every) => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                pass = self.refresh(class, &symbols, &intervals) => {
                    if pass.failed > 0 {
                        warn!(class = %class, ok = pass.succeeded, failed = pass.failed, "refresh pass incomplete");
                    } else {
                        debug!(class = %class, ok = pass.succeeded, "refresh pass done");
                    }
                }
            }
        }
        debug!(class = %class, "refresh loop stopped");
    }
}
