//! Stream frame decoding for Binance futures kline streams.
//!
//! Combined connections wrap every payload as `{"stream": "<key>", "data": {...}}`;
//! single-stream connections deliver the bare event, so the stream key is
//! rebuilt from the payload's symbol and `k.i`.

use serde_json::Value;

use crate::base_classes::bar::Bar;
use crate::base_classes::types::{Interval, ParseIntervalError, StreamKey, Ts};
use crate::utils::parsing::{field_f64, field_str, field_u64};

#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub key: StreamKey,
    pub symbol: String,
    pub interval: Interval,
    pub event_time: Ts,
    pub is_closed: bool,
    pub bar: Bar,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Kline(KlineUpdate),
    // Subscription acks: {"result":null,"id":1}
    Control,
    Other {
        stream: Option<StreamKey>,
        event: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("kline payload missing `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Interval(#[from] ParseIntervalError),
}

/// Decodes one text frame. `fallback` is the sole subscribed key on a
/// single-stream connection, used when the payload omits `k.i`.
pub fn decode_frame(text: &str, fallback: Option<&StreamKey>) -> Result<StreamFrame, FrameError> {
    let root: Value = serde_json::from_str(text)?;
    if !root.is_object() {
        return Err(FrameError::NotAnObject);
    }
    if root.get("result").is_some() && root.get("id").is_some() {
        return Ok(StreamFrame::Control);
    }

    let (stream, payload) = match field_str(&root, "stream") {
        Some(name) => {
            let data = root.get("data").ok_or(FrameError::MissingField("data"))?;
            (Some(StreamKey::from_wire(name)), data)
        }
        None => (None, &root),
    };
    if !payload.is_object() {
        return Err(FrameError::NotAnObject);
    }

    match field_str(payload, "e") {
        Some("kline") => {
            let fallback = stream.as_ref().or(fallback);
            decode_kline(payload, stream.clone(), fallback).map(StreamFrame::Kline)
        }
        event => Ok(StreamFrame::Other {
            stream,
            event: event.map(str::to_string),
        }),
    }
}

fn decode_kline(
    payload: &Value,
    envelope: Option<StreamKey>,
    fallback: Option<&StreamKey>,
) -> Result<KlineUpdate, FrameError> {
    let k = payload.get("k").ok_or(FrameError::MissingField("k"))?;
    let from_key = fallback.and_then(StreamKey::parse_kline);

    let symbol = field_str(payload, "s")
        .or_else(|| field_str(k, "s"))
        .map(str::to_ascii_uppercase)
        .or_else(|| from_key.as_ref().map(|(s, _)| s.clone()))
        .ok_or(FrameError::MissingField("s"))?;
    let interval = match field_str(k, "i") {
        Some(raw) => raw.parse::<Interval>()?,
        None => from_key
            .as_ref()
            .map(|(_, iv)| *iv)
            .ok_or(FrameError::MissingField("k.i"))?,
    };

    let num = |key: &'static str| field_f64(k, key).ok_or(FrameError::MissingField(key));
    let bar = Bar {
        open_time: field_u64(k, "t").ok_or(FrameError::MissingField("t"))?,
        open: num("o")?,
        high: num("h")?,
        low: num("l")?,
        close: num("c")?,
        volume: num("v")?,
        close_time: field_u64(k, "T").unwrap_or(0),
        quote_volume: field_f64(k, "q").unwrap_or(0.0),
        trade_count: field_u64(k, "n").unwrap_or(0),
        taker_buy_base_volume: field_f64(k, "V").unwrap_or(0.0),
        taker_buy_quote_volume: field_f64(k, "Q").unwrap_or(0.0),
    };

    let key = envelope.unwrap_or_else(|| StreamKey::kline(&symbol, interval));
    Ok(KlineUpdate {
        key,
        symbol,
        interval,
        event_time: field_u64(payload, "E").unwrap_or(0),
        is_closed: k.get("x").and_then(Value::as_bool).unwrap_or(false),
        bar,
    })
}
