use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::base_classes::bar_store::UpsertOutcome;
use crate::base_classes::freshness::{FreshnessKey, UpdateSource};
use crate::base_classes::state::MarketState;
use crate::base_classes::ws::StreamHandler;
use crate::exchanges::binance::parser::KlineUpdate;

/// Writes streamed klines into the bar store and marks the key fresh.
///
/// Only buffers that were seeded by the refresh client accept stream bars;
/// a buffer built from the stream alone would have no history behind its
/// forming bar.
#[derive(Debug)]
pub struct BarStoreSink {
    state: Arc<MarketState>,
    applied: AtomicU64,
    uninitialised: AtomicU64,
}

impl BarStoreSink {
    pub fn new(state: Arc<MarketState>) -> Self {
        Self {
            state,
            applied: AtomicU64::new(0),
            uninitialised: AtomicU64::new(0),
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn uninitialised(&self) -> u64 {
        self.uninitialised.load(Ordering::Relaxed)
    }
}

impl StreamHandler for BarStoreSink {
    fn on_kline(&self, update: &KlineUpdate) -> anyhow::Result<()> {
        let outcome = self
            .state
            .bars
            .upsert_if_initialized(&update.symbol, update.interval, update.bar);
        match outcome {
            Some(UpsertOutcome::Inserted | UpsertOutcome::Replaced) => {
                self.state.freshness.mark(
                    FreshnessKey::klines(&update.symbol, update.interval),
                    UpdateSource::Stream,
                );
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            // Counted and logged by the store.
            Some(UpsertOutcome::Rejected) => {}
            None => {
                self.uninitialised.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %update.symbol, interval = %update.interval, "bar for unseeded key dropped");
            }
        }
        Ok(())
    }
}
