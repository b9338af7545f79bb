use serde::{Deserialize, Serialize};

use crate::base_classes::types::Ts;

/// Current funding state from the premium index endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub symbol: String,
    pub funding_rate: f64,
    pub mark_price: f64,
    pub index_price: Option<f64>,
    pub next_funding_time: Ts,
    pub ts: Ts,
}

impl FundingInfo {
    /// Funding rate in basis points.
    #[inline]
    pub fn rate_bps(&self) -> f64 {
        self.funding_rate * 10_000.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub symbol: String,
    pub open_interest: f64,
    pub ts: Ts,
}

impl OpenInterest {
    /// Notional open interest at `price`.
    #[inline]
    pub fn notional(&self, price: f64) -> f64 {
        self.open_interest * price
    }
}

/// Rolling 24h statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_pct: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub close_time: Ts,
}
