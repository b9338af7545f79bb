//! Hysteresis gate between the scoring pipeline and signal publication.
//!
//! Each symbol sits in one of three levels. Leaving a level needs the lower
//! "maintain" threshold to fail, entering one needs the higher "entry"
//! threshold to pass, and either move must be confirmed by K of the last N
//! observations. Confirmed moves inside the cooldown window are suppressed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::base_classes::types::{Ts, normalize_symbol};
use crate::utils::time::{current_unix_ms, dur_ms};

const DEFAULT_CONFIRM_K: usize = 2;
const DEFAULT_WINDOW_N: usize = 3;
const DEFAULT_COOLDOWN_SECS: u64 = 90;

fn default_confirm_k() -> usize {
    DEFAULT_CONFIRM_K
}

fn default_window_n() -> usize {
    DEFAULT_WINDOW_N
}

fn default_watch_entry() -> f64 {
    0.50
}

fn default_watch_maintain() -> f64 {
    0.45
}

fn default_prime_entry() -> f64 {
    0.62
}

fn default_prime_maintain() -> f64 {
    0.55
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PublisherConfig {
    /// Observations that must agree (K).
    #[serde(default = "default_confirm_k")]
    pub confirm_k: usize,
    /// Confirmation window (N).
    #[serde(default = "default_window_n")]
    pub window_n: usize,
    #[serde(default = "default_watch_entry")]
    pub watch_entry: f64,
    #[serde(default = "default_watch_maintain")]
    pub watch_maintain: f64,
    #[serde(default = "default_prime_entry")]
    pub prime_entry: f64,
    #[serde(default = "default_prime_maintain")]
    pub prime_maintain: f64,
    /// PRIME also needs the gates to pass and at least this much EV.
    #[serde(default)]
    pub min_prime_ev: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_k: DEFAULT_CONFIRM_K,
            window_n: DEFAULT_WINDOW_N,
            watch_entry: default_watch_entry(),
            watch_maintain: default_watch_maintain(),
            prime_entry: default_prime_entry(),
            prime_maintain: default_prime_maintain(),
            min_prime_ev: 0.0,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl PublisherConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.confirm_k > 0, "publisher.confirm_k must be positive");
        ensure!(
            self.confirm_k <= self.window_n,
            "publisher.confirm_k ({}) must not exceed window_n ({})",
            self.confirm_k,
            self.window_n
        );
        ensure!(
            self.watch_maintain <= self.watch_entry,
            "publisher.watch_maintain must not exceed watch_entry"
        );
        ensure!(
            self.prime_maintain <= self.prime_entry,
            "publisher.prime_maintain must not exceed prime_entry"
        );
        ensure!(
            self.watch_entry <= self.prime_entry,
            "publisher.watch_entry must not exceed prime_entry"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalLevel {
    Ignore,
    Watch,
    Prime,
}

impl SignalLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalLevel::Ignore => "IGNORE",
            SignalLevel::Watch => "WATCH",
            SignalLevel::Prime => "PRIME",
        }
    }
}

impl fmt::Display for SignalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    probability: f64,
    prime_eligible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalState {
    pub level: SignalLevel,
    pub bars_in_state: u64,
    /// `None` until the first committed transition; never blocks cooldown.
    pub last_change_ms: Option<Ts>,
    pub last_publish_ms: Option<Ts>,
    history: VecDeque<Observation>,
}

impl SignalState {
    fn new(window: usize) -> Self {
        Self {
            level: SignalLevel::Ignore,
            bars_in_state: 0,
            last_change_ms: None,
            last_publish_ms: None,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Recent probabilities, oldest first.
    pub fn history(&self) -> Vec<f64> {
        self.history.iter().map(|o| o.probability).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalTransition {
    pub symbol: String,
    pub from: SignalLevel,
    pub to: SignalLevel,
    pub probability: f64,
    pub expected_value: f64,
    pub ts_ms: Ts,
}

pub struct SignalPublisher {
    cfg: PublisherConfig,
    states: Mutex<HashMap<String, SignalState>>,
    tx: Option<UnboundedSender<SignalTransition>>,
}

impl SignalPublisher {
    /// Panics on an inconsistent confirmation window (`K == 0` or `K > N`).
    pub fn new(cfg: PublisherConfig) -> Self {
        assert!(cfg.confirm_k > 0, "confirm_k must be positive");
        assert!(cfg.confirm_k <= cfg.window_n, "confirm_k must not exceed window_n");
        Self {
            cfg,
            states: Mutex::new(HashMap::new()),
            tx: None,
        }
    }

    /// Committed transitions are also sent to `tx`.
    pub fn with_sink(cfg: PublisherConfig, tx: UnboundedSender<SignalTransition>) -> Self {
        Self {
            tx: Some(tx),
            ..Self::new(cfg)
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.cfg
    }

    pub fn update(
        &self,
        symbol: &str,
        probability: f64,
        expected_value: f64,
        gates_passed: bool,
    ) -> (SignalLevel, bool) {
        self.update_at(symbol, probability, expected_value, gates_passed, current_unix_ms())
    }

    /// [`SignalPublisher::update`] with an explicit clock, for replay and tests.
    pub fn update_at(
        &self,
        symbol: &str,
        probability: f64,
        expected_value: f64,
        gates_passed: bool,
        now_ms: Ts,
    ) -> (SignalLevel, bool) {
        let cfg = &self.cfg;
        let symbol = normalize_symbol(symbol);
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let st = states
            .entry(symbol.clone())
            .or_insert_with(|| SignalState::new(cfg.window_n));

        st.history.push_back(Observation {
            probability,
            prime_eligible: gates_passed && expected_value >= cfg.min_prime_ev,
        });
        while st.history.len() > cfg.window_n {
            st.history.pop_front();
        }
        st.bars_in_state = st.bars_in_state.saturating_add(1);

        let current = st.level;
        if st.history.len() < cfg.confirm_k {
            return (current, false);
        }

        // Thresholds depend on where we are now: maintain to stay, entry to enter.
        let prime_thr = if current == SignalLevel::Prime {
            cfg.prime_maintain
        } else {
            cfg.prime_entry
        };
        let watch_thr = if current >= SignalLevel::Watch {
            cfg.watch_maintain
        } else {
            cfg.watch_entry
        };
        let band = |o: &Observation| {
            if o.prime_eligible && o.probability >= prime_thr {
                SignalLevel::Prime
            } else if o.probability >= watch_thr {
                SignalLevel::Watch
            } else {
                SignalLevel::Ignore
            }
        };

        let target = st.history.back().map(|o| band(o)).unwrap_or(current);
        if target == current {
            return (current, false);
        }

        let agreeing = st
            .history
            .iter()
            .filter(|o| {
                let b = band(*o);
                if target > current { b >= target } else { b <= target }
            })
            .count();
        if agreeing < cfg.confirm_k {
            return (current, false);
        }

        if let Some(last) = st.last_change_ms {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed < dur_ms(cfg.cooldown()) {
                debug!(
                    %symbol,
                    from = %current,
                    to = %target,
                    elapsed_ms = elapsed,
                    "transition suppressed by cooldown"
                );
                return (current, false);
            }
        }

        st.level = target;
        st.bars_in_state = 0;
        st.last_change_ms = Some(now_ms);
        st.last_publish_ms = Some(now_ms);
        info!(%symbol, from = %current, to = %target, probability, "signal transition");

        if let Some(tx) = &self.tx {
            let transition = SignalTransition {
                symbol,
                from: current,
                to: target,
                probability,
                expected_value,
                ts_ms: now_ms,
            };
            if tx.send(transition).is_err() {
                warn!("signal transition receiver dropped");
            }
        }
        (target, true)
    }

    pub fn get_state(&self, symbol: &str) -> Option<SignalState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_symbol(symbol))
            .cloned()
    }

    /// Forgets one symbol; returns whether it was tracked.
    pub fn reset(&self, symbol: &str) -> bool {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize_symbol(symbol))
            .is_some()
    }

    pub fn reset_all(&self) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
