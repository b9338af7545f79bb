pub mod runner;

pub use runner::{FeedConfig, load_config};
