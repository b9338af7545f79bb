//! Wires the feed together: bootstrap, stream subscriptions, refresh loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::base_classes::market_cache::MarketDataCache;
use crate::base_classes::refresh::{BootstrapReport, RefreshClient};
use crate::base_classes::state::MarketState;
use crate::base_classes::types::DataClass;
use crate::base_classes::ws::{Connector, StreamTransport, TungsteniteConnector};
use crate::collectors::BarStoreSink;
use crate::config::FeedConfig;
use crate::exchanges::binance::BinanceRest;
use crate::exchanges::source::MarketDataSource;

/// One feed instance: constructed once at startup and shared by reference.
pub struct MarketFeed {
    cfg: FeedConfig,
    state: Arc<MarketState>,
    transport: Arc<StreamTransport>,
    refresh: Arc<RefreshClient>,
    cache: Arc<MarketDataCache>,
    sink: Arc<BarStoreSink>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MarketFeed {
    /// Live venue: REST over reqwest, stream over tokio-tungstenite.
    pub fn new(cfg: FeedConfig) -> Result<Self> {
        let source = BinanceRest::new(cfg.venue.rest_url.clone(), cfg.rest_timeout())
            .context("failed to build REST client")?;
        Ok(Self::with_parts(cfg, Arc::new(source), Arc::new(TungsteniteConnector)))
    }

    pub fn with_parts(
        cfg: FeedConfig,
        source: Arc<dyn MarketDataSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let state = Arc::new(MarketState::new(cfg.buffer.capacity));
        let refresh = Arc::new(RefreshClient::new(state.clone(), source, cfg.refresh_config()));
        let cache = Arc::new(MarketDataCache::new(refresh.clone(), cfg.ttl.to_ttls()));
        let transport = Arc::new(StreamTransport::new(cfg.transport_config(), connector));
        let sink = Arc::new(BarStoreSink::new(state.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            state,
            transport,
            refresh,
            cache,
            sink,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.cfg
    }

    pub fn state(&self) -> &Arc<MarketState> {
        &self.state
    }

    pub fn cache(&self) -> &Arc<MarketDataCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<StreamTransport> {
        &self.transport
    }

    pub fn refresh_client(&self) -> &Arc<RefreshClient> {
        &self.refresh
    }

    pub fn sink(&self) -> &Arc<BarStoreSink> {
        &self.sink
    }

    /// Seeds the bar buffers, subscribes every (symbol, interval) stream,
    /// opens the connection and spawns the refresh loops.
    pub async fn start(&self) -> Result<BootstrapReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("feed already started");
        }
        let symbols = self.cfg.symbols.clone();
        let intervals = self.cfg.intervals.clone();

        let report = self.refresh.bootstrap(&symbols, &intervals).await;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "some buffers failed to bootstrap; will retry");
        }

        for symbol in &symbols {
            for &interval in &intervals {
                self.transport
                    .subscribe(symbol, interval, self.sink.clone())
                    .with_context(|| format!("subscribe {symbol} {interval}"))?;
            }
        }
        self.transport.start().context("failed to start transport")?;

        let periods = [
            (DataClass::Klines, self.cfg.refresh.klines_secs),
            (DataClass::Funding, self.cfg.refresh.funding_secs),
            (DataClass::OpenInterest, self.cfg.refresh.open_interest_secs),
            (DataClass::Ticker, self.cfg.refresh.ticker_secs),
        ];
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (class, secs) in periods {
            if secs == 0 {
                continue;
            }
            tasks.push(tokio::spawn(self.refresh.clone().run_refresh_loop(
                class,
                Duration::from_secs(secs),
                symbols.clone(),
                intervals.clone(),
                self.shutdown.subscribe(),
            )));
        }

        info!(
            symbols = symbols.len(),
            intervals = intervals.len(),
            refresh_loops = tasks.len(),
            "market feed started"
        );
        Ok(report)
    }

    /// Stops the stream and every refresh loop. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.transport.stop().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let grace = self.cfg.transport_config().close_timeout;
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("market feed stopped");
    }
}
