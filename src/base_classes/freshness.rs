use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::base_classes::types::{DataClass, Interval, Ts, normalize_symbol};
use crate::utils::time::current_unix_ms;

/// Which side of the feed produced the last successful update.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UpdateSource {
    Stream,
    Rest,
}

impl UpdateSource {
    #[inline(always)]
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateSource::Stream => "stream",
            UpdateSource::Rest => "rest",
        }
    }
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FreshnessKey {
    pub class: DataClass,
    pub symbol: String,
    pub interval: Option<Interval>,
}

impl FreshnessKey {
    pub fn klines(symbol: &str, interval: Interval) -> Self {
        Self {
            class: DataClass::Klines,
            symbol: normalize_symbol(symbol),
            interval: Some(interval),
        }
    }

    pub fn snapshot(class: DataClass, symbol: &str) -> Self {
        Self {
            class,
            symbol: normalize_symbol(symbol),
            interval: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FreshnessRecord {
    pub last_update: Instant,
    pub last_update_ms: Ts,
    pub source: UpdateSource,
    pub updates: u64,
}

impl FreshnessRecord {
    #[inline]
    pub fn age(&self) -> Duration {
        self.last_update.elapsed()
    }

    /// Strictly younger than `ttl`; a zero TTL is never fresh.
    #[inline]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Last successful update per data class and key. Written by whichever of the
/// stream or the refresh client succeeded last; read by cache routing.
#[derive(Default, Debug)]
pub struct FreshnessTracker {
    records: RwLock<HashMap<FreshnessKey, FreshnessRecord>>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: FreshnessKey, source: UpdateSource) -> FreshnessRecord {
        let now = Instant::now();
        let now_ms = current_unix_ms();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.entry(key) {
            Entry::Vacant(entry) => *entry.insert(FreshnessRecord {
                last_update: now,
                last_update_ms: now_ms,
                source,
                updates: 1,
            }),
            Entry::Occupied(mut entry) => {
                let rec = entry.get_mut();
                rec.last_update = now;
                rec.last_update_ms = now_ms;
                rec.source = source;
                rec.updates = rec.updates.saturating_add(1);
                *rec
            }
        }
    }

    pub fn get(&self, key: &FreshnessKey) -> Option<FreshnessRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn age(&self, key: &FreshnessKey) -> Option<Duration> {
        self.get(key).map(|rec| rec.age())
    }

    pub fn is_fresh(&self, key: &FreshnessKey, ttl: Duration) -> bool {
        self.get(key).is_some_and(|rec| rec.is_fresh(ttl))
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_never_fresh() {
        let tracker = FreshnessTracker::new();
        let key = FreshnessKey::klines("BTCUSDT", Interval::M1);
        assert!(!tracker.is_fresh(&key, Duration::from_secs(300)));
        assert!(tracker.age(&key).is_none());
    }

    #[test]
    fn mark_records_source_and_counts_updates() {
        let tracker = FreshnessTracker::new();
        let key = FreshnessKey::klines("btc_usdt", Interval::M1);
        tracker.mark(key.clone(), UpdateSource::Rest);
        let rec = tracker.mark(key.clone(), UpdateSource::Stream);
        assert_eq!(rec.source, UpdateSource::Stream);
        assert_eq!(rec.updates, 2);
        assert!(tracker.is_fresh(&FreshnessKey::klines("BTCUSDT", Interval::M1), Duration::from_secs(300)));
    }

    #[test]
    fn zero_ttl_is_stale() {
        let tracker = FreshnessTracker::new();
        let key = FreshnessKey::snapshot(DataClass::Funding, "ETHUSDT");
        tracker.mark(key.clone(), UpdateSource::Rest);
        assert!(!tracker.is_fresh(&key, Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn record_expires_exactly_at_ttl() {
        let tracker = FreshnessTracker::new();
        let key = FreshnessKey::snapshot(DataClass::OrderBook, "BTCUSDT");
        tracker.mark(key.clone(), UpdateSource::Rest);
        let ttl = Duration::from_secs(10);

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(tracker.is_fresh(&key, ttl));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!tracker.is_fresh(&key, ttl));
        assert_eq!(tracker.age(&key), Some(ttl));
    }

    #[test]
    fn classes_are_tracked_independently() {
        let tracker = FreshnessTracker::new();
        tracker.mark(FreshnessKey::snapshot(DataClass::Funding, "ETHUSDT"), UpdateSource::Rest);
        let ttl = Duration::from_secs(60);
        assert!(!tracker.is_fresh(&FreshnessKey::snapshot(DataClass::OrderBook, "ETHUSDT"), ttl));
        assert_eq!(tracker.len(), 1);
    }
}
