//! In-crate fakes shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::base_classes::bar::Bar;
use crate::base_classes::order_book::{BookLevel, OrderBook};
use crate::base_classes::tickers::{FundingInfo, OpenInterest, Ticker24h};
use crate::base_classes::types::{Interval, normalize_symbol};
use crate::exchanges::source::{MarketDataSource, SourceError};

pub const MIN: u64 = 60_000;

/// `n` consecutive one-minute bars starting at `start`, closing at `price + i`.
pub fn minute_bars(start: u64, n: usize, price: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let open_time = start + i as u64 * MIN;
            Bar::flat(open_time, open_time + MIN - 1, price + i as f64)
        })
        .collect()
}

pub fn funding(symbol: &str, rate: f64) -> FundingInfo {
    FundingInfo {
        symbol: normalize_symbol(symbol),
        funding_rate: rate,
        mark_price: 100.0,
        index_price: Some(100.0),
        next_funding_time: 0,
        ts: 0,
    }
}

pub fn open_interest(symbol: &str, contracts: f64) -> OpenInterest {
    OpenInterest {
        symbol: normalize_symbol(symbol),
        open_interest: contracts,
        ts: 0,
    }
}

pub fn ticker(symbol: &str, last_price: f64) -> Ticker24h {
    Ticker24h {
        symbol: normalize_symbol(symbol),
        last_price,
        high_price: last_price,
        low_price: last_price,
        ..Ticker24h::default()
    }
}

pub fn book(symbol: &str, bid: f64, ask: f64) -> OrderBook {
    OrderBook {
        symbol: normalize_symbol(symbol),
        last_update_id: 1,
        bids: vec![BookLevel::new(bid, 1.0)],
        asks: vec![BookLevel::new(ask, 1.0)],
        ts: 0,
    }
}

/// Scripted [`MarketDataSource`]. Unknown symbols answer with a 400; failing
/// symbols (or every symbol while `fail_all` is set) time out. Every call is
/// counted, including failed ones.
#[derive(Default)]
pub struct MockSource {
    bars: Mutex<HashMap<(String, Interval), Vec<Bar>>>,
    funding: Mutex<HashMap<String, FundingInfo>>,
    open_interest: Mutex<HashMap<String, OpenInterest>>,
    books: Mutex<HashMap<String, OrderBook>>,
    tickers: Mutex<HashMap<String, Ticker24h>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bars(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) {
        self.bars
            .lock()
            .unwrap()
            .insert((normalize_symbol(symbol), interval), bars);
    }

    pub fn set_funding(&self, info: FundingInfo) {
        self.funding.lock().unwrap().insert(info.symbol.clone(), info);
    }

    pub fn set_open_interest(&self, oi: OpenInterest) {
        self.open_interest.lock().unwrap().insert(oi.symbol.clone(), oi);
    }

    pub fn set_order_book(&self, book: OrderBook) {
        self.books.lock().unwrap().insert(book.symbol.clone(), book);
    }

    pub fn set_ticker(&self, ticker: Ticker24h) {
        self.tickers.lock().unwrap().insert(ticker.symbol.clone(), ticker);
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(normalize_symbol(symbol));
    }

    pub fn recover_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().remove(&normalize_symbol(symbol));
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, symbol: &str) -> Result<String, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let symbol = normalize_symbol(symbol);
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&symbol) {
            return Err(SourceError::Timeout);
        }
        Ok(symbol)
    }

    fn lookup<T: Clone>(map: &Mutex<HashMap<String, T>>, symbol: &str) -> Result<T, SourceError> {
        map.lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| SourceError::Status {
                status: 400,
                body: "Invalid symbol.".to_string(),
            })
    }
}

#[async_trait]
impl MarketDataSource for MockSource {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Bar>, SourceError> {
        let symbol = self.check(symbol)?;
        let bars = self.bars.lock().unwrap();
        let all = bars.get(&(symbol, interval)).ok_or_else(|| SourceError::Status {
            status: 400,
            body: "Invalid symbol.".to_string(),
        })?;
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }

    async fn fetch_funding(&self, symbol: &str) -> Result<FundingInfo, SourceError> {
        let symbol = self.check(symbol)?;
        Self::lookup(&self.funding, &symbol)
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OpenInterest, SourceError> {
        let symbol = self.check(symbol)?;
        Self::lookup(&self.open_interest, &symbol)
    }

    async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> Result<OrderBook, SourceError> {
        let symbol = self.check(symbol)?;
        Self::lookup(&self.books, &symbol)
    }

    async fn fetch_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, SourceError> {
        let symbol = self.check(symbol)?;
        Self::lookup(&self.tickers, &symbol)
    }
}
