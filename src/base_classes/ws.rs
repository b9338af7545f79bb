//! Persistent multiplexed stream connection.
//!
//! One connection carries every subscribed kline stream. The venue cannot add
//! streams to an open socket in this mode, so any change to the desired set is
//! applied by reconnecting with a freshly built URL. Reconnect requests are
//! coalesced: a burst of subscribe/unsubscribe calls results in one reconnect
//! carrying the final set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::base_classes::types::{Interval, StreamKey};
use crate::exchanges::binance::parser::{KlineUpdate, StreamFrame, decode_frame};
use crate::exchanges::endpoints::BinanceWs;

// ---------------- connection seam ----------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close,
}

#[async_trait]
pub trait WsConnection: Send {
    /// Next inbound event. `Err` is a read fault.
    async fn next_event(&mut self) -> anyhow::Result<WsEvent>;
    async fn send_ping(&mut self) -> anyhow::Result<()>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn WsConnection>>;
}

/// tokio-tungstenite backed connector (rustls, webpki roots).
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn WsConnection>> {
        let (inner, _resp) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(TungsteniteConnection { inner }))
    }
}

struct TungsteniteConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn next_event(&mut self) -> anyhow::Result<WsEvent> {
        loop {
            match self.inner.next().await {
                None => return Ok(WsEvent::Close),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(WsEvent::Text(text)),
                Some(Ok(Message::Binary(bin))) => {
                    return Ok(WsEvent::Text(String::from_utf8_lossy(&bin).into_owned()));
                }
                Some(Ok(Message::Ping(p))) => return Ok(WsEvent::Ping(p)),
                Some(Ok(Message::Pong(_))) => return Ok(WsEvent::Pong),
                Some(Ok(Message::Close(_))) => return Ok(WsEvent::Close),
                Some(Ok(Message::Frame(_))) => continue,
            }
        }
    }

    async fn send_ping(&mut self) -> anyhow::Result<()> {
        self.inner.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.inner.send(Message::Pong(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.inner.close(None).await?;
        Ok(())
    }
}

// ---------------- handlers ----------------

/// Receives every kline update for the streams it is subscribed to. Called on
/// the transport task; must not block.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_kline(&self, update: &KlineUpdate) -> anyhow::Result<()>;
}

impl StreamHandler for UnboundedSender<KlineUpdate> {
    fn on_kline(&self, update: &KlineUpdate) -> anyhow::Result<()> {
        self.send(update.clone())
            .map_err(|_| anyhow!("kline receiver dropped"))
    }
}

/// Adapts a closure into a [`StreamHandler`].
pub struct HandlerFn<F>(pub F);

impl<F> StreamHandler for HandlerFn<F>
where
    F: Fn(&KlineUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_kline(&self, update: &KlineUpdate) -> anyhow::Result<()> {
        (self.0)(update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

// ---------------- config / state ----------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub heartbeat_interval: Duration,
    /// First delay after a fault; doubles per consecutive fault up to
    /// `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_streams: usize,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    /// Quiet period after a subscription change before the stream set is
    /// compared; every further change restarts it.
    pub resubscribe_debounce: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: BinanceWs::BASE.to_string(),
            heartbeat_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5),
            max_streams: BinanceWs::MAX_STREAMS_PER_CONNECTION,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            resubscribe_debounce: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub state: TransportState,
    pub connects: u64,
    pub reconnects: u64,
    pub frames: u64,
    pub dispatched: u64,
    pub malformed: u64,
    pub handler_errors: u64,
    pub streams: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("stream limit reached: at most {max} streams per connection")]
    StreamLimit { max: usize },
    #[error("unknown subscription {0:?}")]
    NotSubscribed(SubscriptionId),
    #[error("transport has been stopped")]
    Stopped,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    reconnects: AtomicU64,
    frames: AtomicU64,
    dispatched: AtomicU64,
    malformed: AtomicU64,
    handler_errors: AtomicU64,
}

type Subscribers = Vec<(SubscriptionId, Arc<dyn StreamHandler>)>;

struct Inner {
    cfg: TransportConfig,
    connector: Arc<dyn Connector>,
    subs: Mutex<BTreeMap<StreamKey, Subscribers>>,
    next_id: AtomicU64,
    wake: Notify,
    force: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<TransportState>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

enum SessionEnd {
    Shutdown,
    Resubscribe,
    Fault(String),
}

pub struct StreamTransport {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new(cfg: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cfg,
                connector,
                subs: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                force: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                state: Mutex::new(TransportState::Disconnected),
                shutdown,
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn with_tungstenite(cfg: TransportConfig) -> Self {
        Self::new(cfg, Arc::new(TungsteniteConnector))
    }

    /// Spawns the connection task. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), TransportError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(run(inner, shutdown));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Registers `handler` for the kline stream of (`symbol`, `interval`).
    /// A new stream on a live connection takes effect after the next
    /// (coalesced) reconnect.
    pub fn subscribe(
        &self,
        symbol: &str,
        interval: Interval,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionId, TransportError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let key = StreamKey::kline(symbol, interval);
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let new_stream = {
            let mut subs = self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner);
            let new_stream = !subs.contains_key(&key);
            if new_stream && subs.len() >= self.inner.cfg.max_streams {
                return Err(TransportError::StreamLimit {
                    max: self.inner.cfg.max_streams,
                });
            }
            subs.entry(key.clone()).or_default().push((id, handler));
            new_stream
        };
        if new_stream {
            debug!(stream = %key, "stream added");
            self.inner.wake.notify_one();
        }
        Ok(id)
    }

    /// Drops one handler; the stream itself goes once its last handler does.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let removed_stream = {
            let mut subs = self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner);
            let key = subs
                .iter()
                .find(|(_, handlers)| handlers.iter().any(|(h, _)| *h == id))
                .map(|(key, _)| key.clone())
                .ok_or(TransportError::NotSubscribed(id))?;
            let now_empty = match subs.get_mut(&key) {
                Some(handlers) => {
                    handlers.retain(|(h, _)| *h != id);
                    handlers.is_empty()
                }
                None => false,
            };
            if now_empty {
                subs.remove(&key);
                Some(key)
            } else {
                None
            }
        };
        if let Some(key) = removed_stream {
            debug!(stream = %key, "stream removed");
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Requests a reconnect with the current stream set. Safe to call at any
    /// time, including while a reconnect is already in progress.
    pub fn reconnect(&self) {
        self.inner.force.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Closes the connection and ends the task. No handler is invoked once
    /// this returns.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _ = self.inner.shutdown.send(true);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut handle) = handle {
            let grace = self.inner.cfg.close_timeout;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("transport task did not exit within {grace:?}; aborting");
                handle.abort();
            }
        }
        self.inner.set_state(TransportState::Disconnected);
    }

    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    pub fn streams(&self) -> Vec<StreamKey> {
        self.inner.desired().into_iter().collect()
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.inner.counters;
        TransportStats {
            state: self.inner.state(),
            connects: c.connects.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            frames: c.frames.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            streams: self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl Inner {
    fn desired(&self) -> BTreeSet<StreamKey> {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: TransportState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn handle_text(&self, text: &str, single: Option<&StreamKey>) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        match decode_frame(text, single) {
            Ok(StreamFrame::Kline(update)) => self.dispatch(&update),
            Ok(StreamFrame::Control) => {}
            Ok(StreamFrame::Other { stream, event }) => {
                debug!(?stream, ?event, "ignoring non-kline frame");
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed frame");
            }
        }
    }

    fn dispatch(&self, update: &KlineUpdate) {
        // Handlers run outside the subscription lock.
        let handlers: Vec<Arc<dyn StreamHandler>> = {
            let subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
            match subs.get(&update.key) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            match catch_unwind(AssertUnwindSafe(|| handler.on_kline(update))) {
                Ok(Ok(())) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %update.key, error = %e, "stream handler failed");
                }
                Err(_) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %update.key, "stream handler panicked");
                }
            }
        }
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let initial_backoff = inner.cfg.reconnect_delay;
    let max_backoff = inner.cfg.max_reconnect_delay.max(initial_backoff);
    let mut backoff = initial_backoff;
    let mut attempts: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let desired = inner.desired();
        if desired.is_empty() {
            inner.set_state(TransportState::Disconnected);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = inner.wake.notified() => {
                    inner.force.store(false, Ordering::Release);
                    continue;
                }
            }
        }

        if attempts > 0 {
            inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        attempts += 1;

        let keys: Vec<StreamKey> = desired.iter().cloned().collect();
        let url = BinanceWs::subscription_url(&inner.cfg.base_url, &keys);
        inner.set_state(TransportState::Connecting);
        inner.force.store(false, Ordering::Release);

        let connect = tokio::time::timeout(inner.cfg.connect_timeout, inner.connector.connect(&url));
        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            res = connect => res,
        };
        let conn = match outcome {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(%url, error = %e, "connect failed; retrying in {}ms", backoff.as_millis());
                if !backoff_sleep(&inner, &mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
            Err(_) => {
                warn!(%url, "connect timed out; retrying in {}ms", backoff.as_millis());
                if !backoff_sleep(&inner, &mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        backoff = initial_backoff;
        inner.counters.connects.fetch_add(1, Ordering::Relaxed);
        inner.set_state(TransportState::Connected);
        info!(streams = keys.len(), %url, "stream connection open");

        match session(&inner, conn, &desired, &mut shutdown).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Resubscribe => {
                info!("stream set changed; reconnecting");
            }
            SessionEnd::Fault(reason) => {
                warn!(%reason, "stream connection fault; reconnecting in {}ms", backoff.as_millis());
                if !backoff_sleep(&inner, &mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    inner.set_state(TransportState::Disconnected);
    debug!("transport task exited");
}

/// Returns false when shutdown was requested during the wait.
async fn backoff_sleep(inner: &Inner, shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    inner.set_state(TransportState::Disconnected);
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn session(
    inner: &Inner,
    mut conn: Box<dyn WsConnection>,
    live: &BTreeSet<StreamKey>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    // Single-stream payloads carry no stream name.
    let single = if live.len() == 1 { live.iter().next().cloned() } else { None };
    let hb_every = inner.cfg.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + hb_every, hb_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Set while subscription changes are settling.
    let mut settle_until: Option<Instant> = None;

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => break SessionEnd::Shutdown,
            _ = inner.wake.notified() => {
                if inner.force.swap(false, Ordering::AcqRel) {
                    break SessionEnd::Resubscribe;
                }
                settle_until = Some(Instant::now() + inner.cfg.resubscribe_debounce);
            }
            _ = tokio::time::sleep_until(settle_until.unwrap_or_else(Instant::now)), if settle_until.is_some() => {
                settle_until = None;
                if inner.desired() != *live {
                    break SessionEnd::Resubscribe;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = conn.send_ping().await {
                    break SessionEnd::Fault(format!("heartbeat: {e}"));
                }
            }
            event = conn.next_event() => match event {
                Ok(WsEvent::Text(text)) => inner.handle_text(&text, single.as_ref()),
                Ok(WsEvent::Ping(payload)) => {
                    if let Err(e) = conn.send_pong(payload).await {
                        break SessionEnd::Fault(format!("pong: {e}"));
                    }
                }
                Ok(WsEvent::Pong) => {}
                Ok(WsEvent::Close) => break SessionEnd::Fault("closed by peer".to_string()),
                Err(e) => break SessionEnd::Fault(format!("read: {e}")),
            }
        }
    };

    inner.set_state(TransportState::Disconnected);
    if let Err(e) = tokio::time::timeout(inner.cfg.close_timeout, conn.close())
        .await
        .unwrap_or_else(|_| Err(anyhow!("close timed out")))
    {
        debug!(error = %e, "close");
    }
    end
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Scripted connection: events come from the paired sender, pings are
    /// counted, a dropped sender reads as a peer close.
    pub struct MockConnection {
        rx: mpsc::UnboundedReceiver<WsEvent>,
        pings: Arc<AtomicU64>,
        fail_ping: bool,
    }

    #[async_trait]
    impl WsConnection for MockConnection {
        async fn next_event(&mut self) -> anyhow::Result<WsEvent> {
            Ok(self.rx.recv().await.unwrap_or(WsEvent::Close))
        }
        async fn send_ping(&mut self) -> anyhow::Result<()> {
            if self.fail_ping {
                return Err(anyhow!("socket gone"));
            }
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn send_pong(&mut self, _payload: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockConnector {
        pub urls: Mutex<Vec<String>>,
        scripted: Mutex<VecDeque<mpsc::UnboundedReceiver<WsEvent>>>,
        idle: Mutex<Vec<mpsc::UnboundedSender<WsEvent>>>,
        pub pings: Arc<AtomicU64>,
        pub fail_ping: AtomicBool,
    }

    impl MockConnector {
        /// Queues a connection and returns the sender feeding it.
        pub fn script(&self) -> mpsc::UnboundedSender<WsEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripted.lock().unwrap().push_back(rx);
            tx
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn WsConnection>> {
            self.urls.lock().unwrap().push(url.to_string());
            let rx = match self.scripted.lock().unwrap().pop_front() {
                Some(rx) => rx,
                None => {
                    // Unscripted connections stay open and silent.
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.idle.lock().unwrap().push(tx);
                    rx
                }
            };
            Ok(Box::new(MockConnection {
                rx,
                pings: self.pings.clone(),
                fail_ping: self.fail_ping.load(Ordering::Relaxed),
            }))
        }
    }
}
