//! Consumers of scored market data.

pub mod signal_publisher;

pub use signal_publisher::{PublisherConfig, SignalLevel, SignalPublisher, SignalState, SignalTransition};
