use serde::{Deserialize, Serialize};

use crate::base_classes::types::Ts;

/// One OHLCV candlestick. Identity within a buffer is `open_time`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: Ts,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: Ts,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Bar {
    /// Flat bar at `price`; handy for fixtures.
    pub fn flat(open_time: Ts, close_time: Ts, price: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            close_time,
            ..Self::default()
        }
    }

    /// OHLC ordering and non-negative volumes.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
            && self.close_time >= self.open_time
    }
}
