use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use market_feed::base_classes::types::normalize_symbol;
use market_feed::{MarketFeed, load_config, logging};
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "feed-watch", about = "Run the market feed and print cache/transport stats")]
struct Cli {
    /// Path to YAML configuration
    #[arg(long, default_value = "config/feed.yaml")]
    config: String,

    /// Comma separated symbols overriding the config file
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between stats lines
    #[arg(long, default_value_t = 10)]
    stats_every: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut config = load_config(&cli.config)?;
    if !cli.symbols.is_empty() {
        config.symbols = cli.symbols.iter().map(|s| normalize_symbol(s)).collect();
        config.validate().context("invalid symbol override")?;
    }
    let symbols = config.symbols.clone();
    let intervals = config.intervals.clone();

    let feed = MarketFeed::new(config)?;
    let report = feed.start().await?;
    info!(
        ok = report.succeeded,
        failed = report.failed.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "bootstrap"
    );

    let mut ticker = interval(Duration::from_secs(cli.stats_every.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let t = feed.transport().stats();
                let c = feed.cache().get_stats();
                println!(
                    "[transport] state={} streams={} connects={} reconnects={} frames={} dispatched={} malformed={} handler_errors={}",
                    t.state, t.streams, t.connects, t.reconnects, t.frames, t.dispatched, t.malformed, t.handler_errors
                );
                println!(
                    "[cache] hits={} misses={} hit_rate={:.3} symbols={} stale={} degraded={} rejected_bars={} pending={}",
                    c.hits, c.misses, c.hit_rate, c.symbols_tracked, c.stale_reads, c.degraded_reads,
                    c.rejected_bars, feed.refresh_client().pending().len()
                );
                for symbol in &symbols {
                    for &iv in &intervals {
                        if let Some(last) = feed.state().bars.read(symbol, iv, 1).last() {
                            println!("  {symbol} {iv} open_time={} close={}", last.open_time, last.close);
                        }
                    }
                }
            }
        }
    }

    feed.stop().await;
    Ok(())
}
