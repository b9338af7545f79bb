use std::io::{BufRead, BufReader};

use anyhow::{Context, Result, bail};
use clap::Parser;
use market_feed::strategy::{PublisherConfig, SignalPublisher, SignalTransition};
use market_feed::{load_config, logging};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(
    name = "signal-replay",
    about = "Replay scored observations through the publication gate"
)]
struct Cli {
    /// CSV input: ts_ms,symbol,probability,ev,gates_passed (stdin when omitted)
    input: Option<String>,

    /// Take publisher thresholds from this YAML config instead of defaults
    #[arg(long)]
    config: Option<String>,

    /// Print transitions as JSON lines
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

struct Row {
    ts_ms: u64,
    symbol: String,
    probability: f64,
    ev: f64,
    gates: bool,
}

fn parse_row(line: &str) -> Result<Row> {
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    if cols.len() != 5 {
        bail!("expected 5 columns, got {}", cols.len());
    }
    Ok(Row {
        ts_ms: cols[0].parse().context("ts_ms")?,
        symbol: cols[1].to_string(),
        probability: cols[2].parse().context("probability")?,
        ev: cols[3].parse().context("ev")?,
        gates: match cols[4] {
            "1" | "true" | "TRUE" => true,
            "0" | "false" | "FALSE" => false,
            other => bail!("gates_passed must be true/false, got {other}"),
        },
    })
}

fn print_transition(t: &SignalTransition, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(t)?);
    } else {
        println!(
            "{} {} {} -> {} p={:.3} ev={:.4}",
            t.ts_ms, t.symbol, t.from, t.to, t.probability, t.expected_value
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let cfg: PublisherConfig = match &cli.config {
        Some(path) => load_config(path)?.publisher,
        None => PublisherConfig::default(),
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let publisher = SignalPublisher::with_sink(cfg, tx);

    let reader: Box<dyn BufRead> = match &cli.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut rows = 0usize;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("ts_ms") {
            continue;
        }
        let row = parse_row(trimmed).with_context(|| format!("line {}", idx + 1))?;
        publisher.update_at(&row.symbol, row.probability, row.ev, row.gates, row.ts_ms);
        rows += 1;
        while let Ok(t) = rx.try_recv() {
            print_transition(&t, cli.json)?;
        }
    }
    eprintln!("replayed {rows} observations");
    Ok(())
}
