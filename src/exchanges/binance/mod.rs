//! Binance USD-M futures integration
//!
//! Stream frame decoding for kline streams and the REST client used for
//! bootstrap and periodic refresh.

pub mod parser;
pub mod rest;

pub use parser::{FrameError, KlineUpdate, StreamFrame, decode_frame};
pub use rest::BinanceRest;
