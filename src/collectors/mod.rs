//! Stream handlers that turn decoded venue events into state updates.

pub mod binance;

pub use binance::BarStoreSink;
