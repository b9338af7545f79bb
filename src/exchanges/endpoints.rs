// Pure endpoint definitions and small URL builders.

use crate::base_classes::types::StreamKey;

// ---------------- Binance USD-M futures ----------------
pub struct BinanceWs;
impl BinanceWs {
    pub const BASE: &str = "wss://fstream.binance.com";

    // Venue-imposed ceiling on streams per connection.
    pub const MAX_STREAMS_PER_CONNECTION: usize = 200;

    // Single stream: wss://fstream.binance.com/ws/btcusdt@kline_1m
    pub fn single_stream_url(base: &str, key: &StreamKey) -> String {
        format!("{}/ws/{}", base.trim_end_matches('/'), key)
    }

    // Combined streams:
    // wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m
    pub fn combined_stream_url(base: &str, keys: &[StreamKey]) -> String {
        let mut url = String::with_capacity(base.len() + 16 + keys.len() * 24);
        url.push_str(base.trim_end_matches('/'));
        url.push_str("/stream?streams=");
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                url.push('/');
            }
            url.push_str(key.as_str());
        }
        url
    }

    /// Single-stream path for one key, combined path otherwise.
    pub fn subscription_url(base: &str, keys: &[StreamKey]) -> String {
        match keys {
            [only] => Self::single_stream_url(base, only),
            _ => Self::combined_stream_url(base, keys),
        }
    }
}

pub struct BinanceGet;
impl BinanceGet {
    pub const BASE: &str = "https://fapi.binance.com";

    pub fn klines(symbol: &str, interval: &str, limit: usize) -> String {
        format!("/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}")
    }
    pub fn premium_index(symbol: &str) -> String {
        format!("/fapi/v1/premiumIndex?symbol={symbol}")
    }
    pub fn open_interest(symbol: &str) -> String {
        format!("/fapi/v1/openInterest?symbol={symbol}")
    }
    pub fn depth(symbol: &str, limit: usize) -> String {
        format!("/fapi/v1/depth?symbol={symbol}&limit={limit}")
    }
    pub fn ticker_24h(symbol: &str) -> String {
        format!("/fapi/v1/ticker/24hr?symbol={symbol}")
    }
}
