use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Ts = u64; // unix milliseconds unless stated otherwise

/// Candlestick interval as spelled by the venue (`1m`, `4h`, `1d`, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    #[inline(always)]
    pub const fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// Nominal bar length in milliseconds (a month is taken as 30 days).
    pub const fn duration_ms(self) -> u64 {
        const MIN: u64 = 60_000;
        match self {
            Interval::M1 => MIN,
            Interval::M3 => 3 * MIN,
            Interval::M5 => 5 * MIN,
            Interval::M15 => 15 * MIN,
            Interval::M30 => 30 * MIN,
            Interval::H1 => 60 * MIN,
            Interval::H2 => 120 * MIN,
            Interval::H4 => 240 * MIN,
            Interval::H6 => 360 * MIN,
            Interval::H8 => 480 * MIN,
            Interval::H12 => 720 * MIN,
            Interval::D1 => 1_440 * MIN,
            Interval::D3 => 3 * 1_440 * MIN,
            Interval::W1 => 7 * 1_440 * MIN,
            Interval::Mo1 => 30 * 1_440 * MIN,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval `{0}`")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Interval::ALL
            .iter()
            .copied()
            .find(|iv| iv.as_str() == trimmed)
            .ok_or_else(|| ParseIntervalError(trimmed.to_string()))
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Venue symbol form: upper case, no separators (`btc_usdt` -> `BTCUSDT`).
#[inline]
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-' && *c != '/')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Identity of one ring buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarKey {
    pub symbol: String,
    pub interval: Interval,
}

impl BarKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            interval,
        }
    }
}

impl fmt::Display for BarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

/// Wire name of one logical stream, e.g. `btcusdt@kline_1m`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn kline(symbol: &str, interval: Interval) -> Self {
        Self(format!(
            "{}@kline_{}",
            normalize_symbol(symbol).to_ascii_lowercase(),
            interval.as_str()
        ))
    }

    /// Wraps a key received from the venue (combined-stream envelope).
    pub fn from_wire(raw: &str) -> Self {
        Self(raw.to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits `btcusdt@kline_1m` back into (`BTCUSDT`, `1m`).
    pub fn parse_kline(&self) -> Option<(String, Interval)> {
        let (symbol, interval) = self.0.split_once("@kline_")?;
        let interval = interval.parse().ok()?;
        Some((normalize_symbol(symbol), interval))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data classes served by the cache; each has its own TTL and refresh cadence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataClass {
    Klines,
    OrderBook,
    Funding,
    OpenInterest,
    Ticker,
}

impl DataClass {
    #[inline(always)]
    pub const fn as_str(self) -> &'static str {
        match self {
            DataClass::Klines => "klines",
            DataClass::OrderBook => "order_book",
            DataClass::Funding => "funding",
            DataClass::OpenInterest => "open_interest",
            DataClass::Ticker => "ticker",
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_round_trips_through_venue_spelling() {
        for iv in Interval::ALL {
            assert_eq!(iv.as_str().parse::<Interval>().unwrap(), iv);
        }
        assert!("2m".parse::<Interval>().is_err());
        assert_eq!(Interval::H4.duration_ms(), 4 * 3_600_000);
    }

    #[test]
    fn month_and_minute_are_distinct() {
        assert_eq!("1M".parse::<Interval>().unwrap(), Interval::Mo1);
        assert_eq!("1m".parse::<Interval>().unwrap(), Interval::M1);
    }

    #[test]
    fn stream_key_uses_lowercase_symbol() {
        let key = StreamKey::kline("btc_usdt", Interval::M5);
        assert_eq!(key.as_str(), "btcusdt@kline_5m");
        assert_eq!(BarKey::new("eth-usdt", Interval::H1).to_string(), "ETHUSDT:1h");
    }

    #[test]
    fn stream_key_parses_back() {
        let key = StreamKey::from_wire("solusdt@kline_15m");
        assert_eq!(key.parse_kline(), Some(("SOLUSDT".to_string(), Interval::M15)));
        assert_eq!(StreamKey::from_wire("btcusdt@aggTrade").parse_kline(), None);
    }
}
