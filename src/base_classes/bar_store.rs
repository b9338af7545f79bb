//! Fixed-capacity bar buffers keyed by (symbol, interval).
//!
//! Each buffer keeps `open_time` strictly increasing. The last bar is the
//! forming bar and may be rewritten in place; everything before it is frozen.
//! Writers lock one buffer for the duration of a single ring mutation, readers
//! take a copy under the same short lock, and the outer map is only written
//! when a buffer is created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::warn;

use crate::base_classes::bar::Bar;
use crate::base_classes::types::{BarKey, Interval, Ts};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Rejected,
}

#[derive(Debug)]
pub struct BarRing {
    bars: VecDeque<Bar>,
    capacity: usize,
    rejected: u64,
}

impl BarRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bar ring capacity must be positive");
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
            rejected: 0,
        }
    }

    pub fn upsert(&mut self, bar: Bar) -> UpsertOutcome {
        let last_open = self.bars.back().map(|b| b.open_time);
        match last_open {
            Some(last) if bar.open_time == last => {
                if let Some(slot) = self.bars.back_mut() {
                    *slot = bar;
                }
                UpsertOutcome::Replaced
            }
            Some(last) if bar.open_time < last => {
                self.rejected = self.rejected.saturating_add(1);
                UpsertOutcome::Rejected
            }
            _ => {
                self.bars.push_back(bar);
                while self.bars.len() > self.capacity {
                    self.bars.pop_front();
                }
                UpsertOutcome::Inserted
            }
        }
    }

    /// Up to `limit` most recent bars, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(limit);
        self.bars.iter().skip(skip).copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn last_open_time(&self) -> Option<Ts> {
        self.bars.back().map(|b| b.open_time)
    }
}

type SharedRing = Arc<Mutex<BarRing>>;

/// Keyed collection of [`BarRing`]s. Buffers live until the store is dropped.
#[derive(Debug)]
pub struct BarStore {
    capacity: usize,
    rings: RwLock<HashMap<BarKey, SharedRing>>,
    rejected_total: AtomicU64,
}

impl BarStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bar store capacity must be positive");
        Self {
            capacity,
            rings: RwLock::new(HashMap::new()),
            rejected_total: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ring(&self, key: &BarKey) -> Option<SharedRing> {
        self.rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn ring_or_create(&self, key: &BarKey) -> SharedRing {
        if let Some(ring) = self.ring(key) {
            return ring;
        }
        let mut rings = self.rings.write().unwrap_or_else(PoisonError::into_inner);
        rings
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BarRing::new(self.capacity))))
            .clone()
    }

    fn apply(&self, key: &BarKey, ring: &SharedRing, bar: Bar) -> UpsertOutcome {
        let (outcome, last) = {
            let mut guard = ring.lock().unwrap_or_else(PoisonError::into_inner);
            let last = guard.last_open_time();
            (guard.upsert(bar), last)
        };
        if outcome == UpsertOutcome::Rejected {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %key,
                open_time = bar.open_time,
                last_open_time = ?last,
                "out-of-order bar rejected"
            );
        }
        outcome
    }

    /// Inserts, replaces the forming bar, or rejects an out-of-order bar.
    /// Creates the buffer on first use.
    pub fn upsert(&self, symbol: &str, interval: Interval, bar: Bar) -> UpsertOutcome {
        let key = BarKey::new(symbol, interval);
        let ring = self.ring_or_create(&key);
        self.apply(&key, &ring, bar)
    }

    /// Like [`BarStore::upsert`] but never creates a buffer. Returns `None`
    /// when the key has not been initialised.
    pub fn upsert_if_initialized(
        &self,
        symbol: &str,
        interval: Interval,
        bar: Bar,
    ) -> Option<UpsertOutcome> {
        let key = BarKey::new(symbol, interval);
        let ring = self.ring(&key)?;
        Some(self.apply(&key, &ring, bar))
    }

    /// Upserts a batch in ascending `open_time` order; returns how many bars
    /// were inserted or replaced.
    /// An empty batch never creates a buffer.
    pub fn upsert_many(&self, symbol: &str, interval: Interval, mut bars: Vec<Bar>) -> usize {
        if bars.is_empty() {
            return 0;
        }
        bars.sort_by_key(|b| b.open_time);
        let key = BarKey::new(symbol, interval);
        let ring = self.ring_or_create(&key);
        bars.into_iter()
            .filter(|bar| self.apply(&key, &ring, *bar) != UpsertOutcome::Rejected)
            .count()
    }

    /// Copy of up to `limit` most recent bars, most recent last.
    pub fn read(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<Bar> {
        let key = BarKey::new(symbol, interval);
        match self.ring(&key) {
            Some(ring) => ring
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tail(limit),
            None => Vec::new(),
        }
    }

    pub fn count(&self, symbol: &str, interval: Interval) -> usize {
        let key = BarKey::new(symbol, interval);
        self.ring(&key)
            .map(|ring| ring.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    pub fn last_open_time(&self, symbol: &str, interval: Interval) -> Option<Ts> {
        self.ring(&BarKey::new(symbol, interval))
            .and_then(|ring| ring.lock().unwrap_or_else(PoisonError::into_inner).last_open_time())
    }

    pub fn is_initialized(&self, symbol: &str, interval: Interval) -> bool {
        self.ring(&BarKey::new(symbol, interval)).is_some()
    }

    pub fn keys(&self) -> Vec<BarKey> {
        let mut keys: Vec<BarKey> = self
            .rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn symbols(&self) -> HashSet<String> {
        self.rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|k| k.symbol.clone())
            .collect()
    }

    #[inline]
    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIN: u64 = 60_000;

    fn bar(open_time: u64, close: f64) -> Bar {
        Bar::flat(open_time, open_time + MIN - 1, close)
    }

    #[test]
    fn forming_bar_is_replaced_in_place() {
        let store = BarStore::new(4);
        assert_eq!(store.upsert("BTCUSDT", Interval::M1, bar(0, 1.0)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert("BTCUSDT", Interval::M1, bar(MIN, 2.0)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert("BTCUSDT", Interval::M1, bar(MIN, 2.5)), UpsertOutcome::Replaced);
        assert_eq!(store.upsert("BTCUSDT", Interval::M1, bar(MIN, 3.0)), UpsertOutcome::Replaced);

        let bars = store.read("BTCUSDT", Interval::M1, 10);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 3.0);
    }

    #[test]
    fn older_bars_are_rejected_and_counted() {
        let store = BarStore::new(4);
        store.upsert("ETHUSDT", Interval::M5, bar(2 * MIN, 1.0));
        store.upsert("ETHUSDT", Interval::M5, bar(3 * MIN, 1.0));
        assert_eq!(store.upsert("ETHUSDT", Interval::M5, bar(2 * MIN, 9.0)), UpsertOutcome::Rejected);
        assert_eq!(store.upsert("ETHUSDT", Interval::M5, bar(MIN, 9.0)), UpsertOutcome::Rejected);
        assert_eq!(store.rejected_total(), 2);
        assert_eq!(store.read("ETHUSDT", Interval::M5, 10)[0].close, 1.0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = BarStore::new(3);
        for i in 0..5 {
            store.upsert("BTCUSDT", Interval::M1, bar(i * MIN, i as f64));
        }
        let bars = store.read("BTCUSDT", Interval::M1, 10);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].open_time, 2 * MIN);
        assert_eq!(bars[2].open_time, 4 * MIN);
    }

    #[test]
    fn read_limit_returns_most_recent_last() {
        let store = BarStore::new(10);
        for i in 0..6 {
            store.upsert("BTCUSDT", Interval::M1, bar(i * MIN, i as f64));
        }
        let bars = store.read("BTCUSDT", Interval::M1, 2);
        assert_eq!(bars.iter().map(|b| b.close).collect::<Vec<_>>(), vec![4.0, 5.0]);
        assert!(store.read("BTCUSDT", Interval::M1, 0).is_empty());
        assert!(store.read("SOLUSDT", Interval::M1, 5).is_empty());
    }

    #[test]
    fn upsert_if_initialized_does_not_create() {
        let store = BarStore::new(3);
        assert_eq!(store.upsert_if_initialized("BTCUSDT", Interval::M1, bar(0, 1.0)), None);
        assert!(!store.is_initialized("BTCUSDT", Interval::M1));
        store.upsert("BTCUSDT", Interval::M1, bar(0, 1.0));
        assert_eq!(
            store.upsert_if_initialized("btc_usdt", Interval::M1, bar(MIN, 1.0)),
            Some(UpsertOutcome::Inserted)
        );
        assert_eq!(store.count("BTCUSDT", Interval::M1), 2);
    }

    #[test]
    fn upsert_many_sorts_before_applying() {
        let store = BarStore::new(10);
        let applied = store.upsert_many(
            "BTCUSDT",
            Interval::M1,
            vec![bar(2 * MIN, 3.0), bar(0, 1.0), bar(MIN, 2.0)],
        );
        assert_eq!(applied, 3);
        assert_eq!(store.rejected_total(), 0);
        assert_eq!(store.symbols().len(), 1);
    }

    #[test]
    fn empty_batch_creates_no_buffer() {
        let store = BarStore::new(10);
        assert_eq!(store.upsert_many("NEWUSDT", Interval::M1, Vec::new()), 0);
        assert!(!store.is_initialized("NEWUSDT", Interval::M1));
        assert!(store.keys().is_empty());
    }

    proptest! {
        #[test]
        fn open_time_strictly_increases_and_len_is_bounded(
            capacity in 1usize..16,
            opens in proptest::collection::vec(0u64..40, 0..200),
        ) {
            let store = BarStore::new(capacity);
            for (i, open) in opens.iter().enumerate() {
                store.upsert("BTCUSDT", Interval::M1, bar(open * MIN, i as f64));
            }
            let bars = store.read("BTCUSDT", Interval::M1, usize::MAX);
            prop_assert!(bars.len() <= capacity);
            for pair in bars.windows(2) {
                prop_assert!(pair[0].open_time < pair[1].open_time);
            }
        }

        #[test]
        fn repeated_forming_updates_keep_length(
            repeats in 1usize..50,
        ) {
            let store = BarStore::new(5);
            store.upsert("BTCUSDT", Interval::M1, bar(0, 1.0));
            store.upsert("BTCUSDT", Interval::M1, bar(MIN, 1.0));
            for i in 0..repeats {
                let outcome = store.upsert("BTCUSDT", Interval::M1, bar(MIN, i as f64));
                prop_assert_eq!(outcome, UpsertOutcome::Replaced);
                prop_assert_eq!(store.count("BTCUSDT", Interval::M1), 2);
            }
        }
    }
}
