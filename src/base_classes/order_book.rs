use serde::{Deserialize, Serialize};

use crate::base_classes::types::Ts;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub px: f64,
    pub qty: f64,
}

impl BookLevel {
    #[inline(always)]
    pub const fn new(px: f64, qty: f64) -> Self {
        Self { px, qty }
    }
}

/// Depth snapshot. Bids descending, asks ascending.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts: Ts,
}

impl OrderBook {
    #[inline]
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    #[inline]
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) if b.px > 0.0 && a.px > 0.0 => Some(0.5 * (b.px + a.px)),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        let spread = self.best_ask()?.px - self.best_bid()?.px;
        Some(spread / mid * 10_000.0)
    }

    /// Bid quantity over total quantity across the top `depth` levels.
    pub fn imbalance(&self, depth: usize) -> Option<f64> {
        let bid: f64 = self.bids.iter().take(depth).map(|l| l.qty).sum();
        let ask: f64 = self.asks.iter().take(depth).map(|l| l.qty).sum();
        let total = bid + ask;
        (total > 0.0).then(|| bid / total)
    }
}
