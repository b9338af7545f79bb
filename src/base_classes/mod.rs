//! Core data structures and the services built on them.

pub mod bar;
pub mod bar_store;
pub mod engine;
pub mod freshness;
pub mod market_cache;
pub mod order_book;
pub mod refresh;
pub mod snapshots;
pub mod state;
pub mod tickers;
pub mod types;
pub mod ws;
