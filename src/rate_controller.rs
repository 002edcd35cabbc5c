//! Closed-loop crawl rate control.
//!
//! Workers feed one [`Outcome`] per fetch into a bounded sliding window; the
//! controller turns the window into a `(target_workers, current_delay)`
//! setpoint. The setpoint is published through a watch channel so the pool
//! manager and every worker read the latest decision without locking, and a
//! reader never observes an earlier decision after a later one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Categorical result of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    ServerError,
    ClientError,
    Timeout,
}

/// The published control pair. Delay is advisory: a worker reads it once
/// before each fetch and sleeps that long after the fetch completes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub target_workers: u32,
    pub current_delay: f64,
}

/// Controller state as persisted in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub current_delay: f64,
    pub target_workers: u32,
}

/// Tunables for the governor.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    pub initial_workers: u32,
    pub min_delay: f64,
    pub max_delay: f64,
    pub initial_delay: f64,
    pub window_size: usize,
    pub aggressive: bool,
    /// When false the setpoint is frozen at the initial values; outcomes are
    /// still counted for the end-of-run summary.
    pub adaptive: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            initial_workers: 4,
            min_delay: 0.5,
            max_delay: 30.0,
            initial_delay: 1.0,
            window_size: 20,
            aggressive: false,
            adaptive: true,
        }
    }
}

/// Cumulative outcome counters for the end-of-run summary.
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub total: u64,
    pub success: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub client_errors: u64,
    pub timeouts: u64,
    pub adjustments: u64,
}

struct CtlState {
    window: VecDeque<Outcome>,
    delay: f64,
    workers: u32,
    /// Consecutive relax decisions taken while the delay sits at the floor.
    relax_streak: usize,
    last_decision: Instant,
    stats: ControllerStats,
}

/// The rate governor. One writer (any worker appending an outcome triggers a
/// decision; the manager tick covers quiet periods), many readers via the
/// watch channel.
pub struct RateController {
    cfg: ControllerConfig,
    state: Mutex<CtlState>,
    tx: watch::Sender<Setpoint>,
}

/// A decision is also evaluated at most this often without new outcomes.
pub const DECISION_TICK: Duration = Duration::from_secs(2);

impl RateController {
    pub fn new(cfg: ControllerConfig) -> (Arc<Self>, watch::Receiver<Setpoint>) {
        let initial = Setpoint {
            target_workers: cfg.initial_workers.clamp(cfg.min_workers, cfg.max_workers),
            current_delay: cfg.initial_delay.clamp(cfg.min_delay, cfg.max_delay),
        };
        let (tx, rx) = watch::channel(initial);
        let controller = Arc::new(Self {
            state: Mutex::new(CtlState {
                window: VecDeque::with_capacity(cfg.window_size),
                delay: initial.current_delay,
                workers: initial.target_workers,
                relax_streak: 0,
                last_decision: Instant::now(),
                stats: ControllerStats::default(),
            }),
            cfg,
            tx,
        });
        (controller, rx)
    }

    /// Append one outcome and evaluate the decision table.
    pub fn record(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        state.stats.total += 1;
        match outcome {
            Outcome::Success => state.stats.success += 1,
            Outcome::RateLimited => state.stats.rate_limited += 1,
            Outcome::ServerError => state.stats.server_errors += 1,
            Outcome::ClientError => state.stats.client_errors += 1,
            Outcome::Timeout => state.stats.timeouts += 1,
        }
        if state.window.len() == self.cfg.window_size {
            state.window.pop_front();
        }
        state.window.push_back(outcome);
        self.decide(&mut state);
    }

    /// Periodic evaluation for quiet stretches with no new outcomes.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        if state.last_decision.elapsed() >= DECISION_TICK {
            self.decide(&mut state);
        }
    }

    /// Restore the setpoint from a checkpoint, clamped to the current limits.
    pub fn restore(&self, snapshot: &ControllerSnapshot) {
        let mut state = self.state.lock();
        state.delay = snapshot.current_delay.clamp(self.cfg.min_delay, self.cfg.max_delay);
        state.workers = snapshot
            .target_workers
            .clamp(self.cfg.min_workers, self.cfg.max_workers);
        state.relax_streak = 0;
        let setpoint = Setpoint {
            target_workers: state.workers,
            current_delay: state.delay,
        };
        self.tx.send_replace(setpoint);
    }

    pub fn setpoint(&self) -> Setpoint {
        *self.tx.borrow()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let state = self.state.lock();
        ControllerSnapshot {
            current_delay: state.delay,
            target_workers: state.workers,
        }
    }

    pub fn stats(&self) -> ControllerStats {
        self.state.lock().stats.clone()
    }

    /// The threshold decision table. Hysteresis: exactly one rule
    /// fires per decision, so each parameter changes at most once.
    fn decide(&self, state: &mut CtlState) {
        state.last_decision = Instant::now();
        if !self.cfg.adaptive || state.window.is_empty() {
            return;
        }

        let n = state.window.len();
        let count = |kind: Outcome| state.window.iter().filter(|o| **o == kind).count();
        let rate_limited = count(Outcome::RateLimited);
        let server_errors = count(Outcome::ServerError);
        let timeouts = count(Outcome::Timeout);
        let recent_rate_limited = state
            .window
            .iter()
            .rev()
            .take(5)
            .filter(|o| **o == Outcome::RateLimited)
            .count();
        let half = (self.cfg.window_size / 2).max(1);

        let before = (state.workers, state.delay);

        if rate_limited as f64 / n as f64 >= 0.20 || recent_rate_limited >= 2 {
            let (mult, dec) = if self.cfg.aggressive { (2.0, 2) } else { (1.5, 1) };
            state.delay = (state.delay * mult).min(self.cfg.max_delay);
            state.workers = state.workers.saturating_sub(dec).max(self.cfg.min_workers);
            state.relax_streak = 0;
        } else if server_errors as f64 / n as f64 >= 0.30 {
            state.delay = (state.delay * 1.25).min(self.cfg.max_delay);
            state.workers = state.workers.saturating_sub(1).max(self.cfg.min_workers);
            state.relax_streak = 0;
        } else if timeouts as f64 / n as f64 >= 0.25 {
            state.workers = state.workers.saturating_sub(1).max(self.cfg.min_workers);
            state.relax_streak = 0;
        } else if n >= half
            && rate_limited == 0
            && state.window.iter().rev().take(half).all(|o| *o == Outcome::Success)
        {
            state.delay = (state.delay * 0.9).max(self.cfg.min_delay);
            if state.delay <= self.cfg.min_delay + f64::EPSILON {
                state.relax_streak += 1;
                if state.relax_streak >= half {
                    state.workers = (state.workers + 1).min(self.cfg.max_workers);
                    state.relax_streak = 0;
                }
            } else {
                state.relax_streak = 0;
            }
        } else {
            return; // hold
        }

        let after = (state.workers, state.delay);
        if after != before {
            state.stats.adjustments += 1;
            debug!(
                workers = state.workers,
                delay_secs = state.delay,
                "rate setpoint adjusted"
            );
        }
        self.tx.send_replace(Setpoint {
            target_workers: state.workers,
            current_delay: state.delay,
        });
    }
}
