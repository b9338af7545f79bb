use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::base_classes::bar::Bar;
use crate::base_classes::order_book::{BookLevel, OrderBook};
use crate::base_classes::tickers::{FundingInfo, OpenInterest, Ticker24h};
use crate::base_classes::types::{Interval, normalize_symbol};
use crate::exchanges::endpoints::BinanceGet as Endp;
use crate::exchanges::source::{MarketDataSource, SourceError};
use crate::utils::parsing::{field_f64, field_str, field_u64, value_to_f64, value_to_u64};

pub struct BinanceRest {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRest {
    /// Every request carries `timeout`; a timed-out call surfaces as
    /// [`SourceError::Timeout`].
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "rest request");
        let resp = self.client.get(&url).send().await.map_err(map_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>().await.map_err(map_reqwest)
    }
}

fn map_reqwest(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Http(err)
    }
}

#[async_trait]
impl MarketDataSource for BinanceRest {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Bar>, SourceError> {
        // Binance REST endpoints expect symbols without separators (e.g. BTCUSDT).
        let symbol = normalize_symbol(symbol);
        let raw = self
            .get_json(&Endp::klines(&symbol, interval.as_str(), limit))
            .await?;
        parse_kline_rows(&raw)
    }

    async fn fetch_funding(&self, symbol: &str) -> Result<FundingInfo, SourceError> {
        let raw = self
            .get_json(&Endp::premium_index(&normalize_symbol(symbol)))
            .await?;
        parse_premium_index(&raw)
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OpenInterest, SourceError> {
        let raw = self
            .get_json(&Endp::open_interest(&normalize_symbol(symbol)))
            .await?;
        parse_open_interest(&raw)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, SourceError> {
        let symbol = normalize_symbol(symbol);
        let raw = self.get_json(&Endp::depth(&symbol, depth)).await?;
        parse_depth(&symbol, raw)
    }

    async fn fetch_ticker_24h(&self, symbol: &str) -> Result<Ticker24h, SourceError> {
        let raw = self
            .get_json(&Endp::ticker_24h(&normalize_symbol(symbol)))
            .await?;
        parse_ticker_24h(&raw)
    }
}

/// Kline history rows:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, trades,
///   takerBuyBase, takerBuyQuote, ignored]`
pub fn parse_kline_rows(raw: &Value) -> Result<Vec<Bar>, SourceError> {
    let rows = raw
        .as_array()
        .ok_or_else(|| SourceError::Decode("kline response is not an array".into()))?;
    rows.iter().enumerate().map(|(i, row)| parse_kline_row(i, row)).collect()
}

fn parse_kline_row(idx: usize, row: &Value) -> Result<Bar, SourceError> {
    let cols = row
        .as_array()
        .filter(|c| c.len() >= 11)
        .ok_or_else(|| SourceError::Decode(format!("kline row {idx} has fewer than 11 fields")))?;
    let f = |i: usize| {
        value_to_f64(&cols[i])
            .ok_or_else(|| SourceError::Decode(format!("kline row {idx} field {i} is not numeric")))
    };
    let u = |i: usize| {
        value_to_u64(&cols[i])
            .ok_or_else(|| SourceError::Decode(format!("kline row {idx} field {i} is not an integer")))
    };
    Ok(Bar {
        open_time: u(0)?,
        open: f(1)?,
        high: f(2)?,
        low: f(3)?,
        close: f(4)?,
        volume: f(5)?,
        close_time: u(6)?,
        quote_volume: f(7)?,
        trade_count: u(8)?,
        taker_buy_base_volume: f(9)?,
        taker_buy_quote_volume: f(10)?,
    })
}

pub fn parse_premium_index(raw: &Value) -> Result<FundingInfo, SourceError> {
    let symbol = field_str(raw, "symbol")
        .ok_or_else(|| SourceError::Decode("premiumIndex missing symbol".into()))?;
    Ok(FundingInfo {
        symbol: symbol.to_string(),
        funding_rate: field_f64(raw, "lastFundingRate")
            .ok_or_else(|| SourceError::Decode("premiumIndex missing lastFundingRate".into()))?,
        mark_price: field_f64(raw, "markPrice").unwrap_or(0.0),
        index_price: field_f64(raw, "indexPrice"),
        next_funding_time: field_u64(raw, "nextFundingTime").unwrap_or(0),
        ts: field_u64(raw, "time").unwrap_or(0),
    })
}

pub fn parse_open_interest(raw: &Value) -> Result<OpenInterest, SourceError> {
    Ok(OpenInterest {
        symbol: field_str(raw, "symbol").unwrap_or_default().to_string(),
        open_interest: field_f64(raw, "openInterest")
            .ok_or_else(|| SourceError::Decode("openInterest missing value".into()))?,
        ts: field_u64(raw, "time").unwrap_or(0),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(rename = "T", default)]
    transaction_time: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

pub fn parse_depth(symbol: &str, raw: Value) -> Result<OrderBook, SourceError> {
    let snap: DepthSnapshot =
        serde_json::from_value(raw).map_err(|e| SourceError::Decode(format!("depth: {e}")))?;
    let levels = |side: Vec<[String; 2]>| -> Result<Vec<BookLevel>, SourceError> {
        side.into_iter()
            .map(|[px, qty]| match (px.parse::<f64>(), qty.parse::<f64>()) {
                (Ok(px), Ok(qty)) => Ok(BookLevel::new(px, qty)),
                _ => Err(SourceError::Decode(format!("depth level {px}/{qty} is not numeric"))),
            })
            .collect()
    };
    Ok(OrderBook {
        symbol: symbol.to_string(),
        last_update_id: snap.last_update_id,
        bids: levels(snap.bids)?,
        asks: levels(snap.asks)?,
        ts: snap.transaction_time,
    })
}

pub fn parse_ticker_24h(raw: &Value) -> Result<Ticker24h, SourceError> {
    let symbol = field_str(raw, "symbol")
        .ok_or_else(|| SourceError::Decode("ticker missing symbol".into()))?;
    Ok(Ticker24h {
        symbol: symbol.to_string(),
        last_price: field_f64(raw, "lastPrice")
            .ok_or_else(|| SourceError::Decode("ticker missing lastPrice".into()))?,
        price_change_pct: field_f64(raw, "priceChangePercent").unwrap_or(0.0),
        high_price: field_f64(raw, "highPrice").unwrap_or(0.0),
        low_price: field_f64(raw, "lowPrice").unwrap_or(0.0),
        volume: field_f64(raw, "volume").unwrap_or(0.0),
        quote_volume: field_f64(raw, "quoteVolume").unwrap_or(0.0),
        trade_count: field_u64(raw, "count").unwrap_or(0),
        close_time: field_u64(raw, "closeTime").unwrap_or(0),
    })
}
