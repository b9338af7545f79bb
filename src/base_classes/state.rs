use crate::base_classes::bar_store::BarStore;
use crate::base_classes::freshness::FreshnessTracker;
use crate::base_classes::order_book::OrderBook;
use crate::base_classes::snapshots::SnapshotStore;
use crate::base_classes::tickers::{FundingInfo, OpenInterest, Ticker24h};

/// All market data shared by the stream handlers, the refresh client and the
/// cache. Built once at startup and handed around as `Arc<MarketState>`.
#[derive(Debug)]
pub struct MarketState {
    pub bars: BarStore,
    pub freshness: FreshnessTracker,
    pub funding: SnapshotStore<FundingInfo>,
    pub open_interest: SnapshotStore<OpenInterest>,
    pub order_books: SnapshotStore<OrderBook>,
    pub tickers: SnapshotStore<Ticker24h>,
}

impl MarketState {
    pub fn new(bar_capacity: usize) -> Self {
        Self {
            bars: BarStore::new(bar_capacity),
            freshness: FreshnessTracker::new(),
            funding: SnapshotStore::new(),
            open_interest: SnapshotStore::new(),
            order_books: SnapshotStore::new(),
            tickers: SnapshotStore::new(),
        }
    }
}
