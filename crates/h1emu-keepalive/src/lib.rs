//! Keepalive timers for the H1emu session layer.
//!
//! Every tracked session gets two independent timers:
//!
//! - a **ping** timer that fires every `ping_interval` so the owner can
//!   probe the peer, and
//! - a **timeout** check that fires when the peer's idle window
//!   (`ping_timeout` after `last_seen`) closes.
//!
//! Inbound traffic does not touch the ping cadence. It only moves
//! `last_seen`, which the owner consults when a timeout check fires. A
//! single late packet therefore never causes an eviction on its own, and a
//! dead peer is gone at most `ping_timeout` after it fell silent.
//!
//! # Integration
//!
//! The scheduler does not own sessions or a clock source beyond Tokio's.
//! It sits in the orchestrator's `tokio::select!` loop next to the I/O
//! channel:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(event) = bridge.recv() => { /* admit, dispatch */ }
//!         Some(timer) = keepalive.next_event() => match timer {
//!             KeepaliveEvent::Ping(id) => send_ping(id),
//!             KeepaliveEvent::TimeoutCheck(id) => {
//!                 if timed_out(id) { keepalive.cancel(&id); evict(id) }
//!                 else { keepalive.check_again_at(&id, deadline(id)) }
//!             }
//!         },
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Keepalive timing.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Period of the ping timer. Default: 5000 ms.
    pub ping_interval: Duration,
    /// Idle window after which a silent peer is considered dead.
    /// Default: 12000 ms.
    pub ping_timeout: Duration,
    /// Random delay (0–max) added to the *first* ping of each session, so
    /// sessions admitted in the same burst don't ping in lockstep.
    /// Default: 100 ms.
    pub initial_ping_jitter: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(5_000),
            ping_timeout: Duration::from_millis(12_000),
            initial_ping_jitter: Duration::from_millis(100),
        }
    }
}

impl KeepaliveConfig {
    /// Smallest interval or timeout the scheduler accepts.
    pub const MIN_PERIOD: Duration = Duration::from_millis(1);

    /// Largest interval, timeout or jitter the scheduler accepts. The
    /// timer wheel behind [`DelayQueue`] cannot hold deadlines much past
    /// two years.
    pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`KeepaliveScheduler::new`]. Rules:
    /// - `ping_interval` and `ping_timeout` are raised to [`Self::MIN_PERIOD`].
    /// - All three values are capped at [`Self::MAX_PERIOD`].
    /// - A `ping_timeout` no longer than `ping_interval` is kept but
    ///   warned about: peers will be evicted between two pings.
    pub fn validated(mut self) -> Self {
        if self.ping_interval < Self::MIN_PERIOD {
            warn!("ping_interval below 1 ms, clamping");
            self.ping_interval = Self::MIN_PERIOD;
        }
        if self.ping_timeout < Self::MIN_PERIOD {
            warn!("ping_timeout below 1 ms, clamping");
            self.ping_timeout = Self::MIN_PERIOD;
        }
        for (name, value) in [
            ("ping_interval", &mut self.ping_interval),
            ("ping_timeout", &mut self.ping_timeout),
            ("initial_ping_jitter", &mut self.initial_ping_jitter),
        ] {
            if *value > Self::MAX_PERIOD {
                warn!(setting = name, "above one year, clamping");
                *value = Self::MAX_PERIOD;
            }
        }
        if self.ping_timeout <= self.ping_interval {
            warn!(
                interval_ms = self.ping_interval.as_millis() as u64,
                timeout_ms = self.ping_timeout.as_millis() as u64,
                "ping_timeout does not exceed ping_interval"
            );
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent<K> {
    /// Time to probe this peer. The next ping is already scheduled.
    Ping(K),
    /// This peer's idle window may have closed. The owner must either
    /// [`cancel`](KeepaliveScheduler::cancel) it or re-arm it with
    /// [`check_again_at`](KeepaliveScheduler::check_again_at).
    TimeoutCheck(K),
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Default)]
pub struct KeepaliveStats {
    /// Ping timers fired.
    pub pings: u64,
    /// Timeout checks fired.
    pub timeout_checks: u64,
    /// Keys cancelled (eviction or shutdown).
    pub cancelled: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Ping,
    Timeout,
}

/// Live queue keys for one tracked session.
struct Timers {
    ping: Key,
    /// `None` between a fired timeout check and the owner's decision.
    timeout: Option<Key>,
}

/// Per-session ping and timeout timers on one [`DelayQueue`].
///
/// Generic over the session key so it has no opinion on what a session
/// is.
pub struct KeepaliveScheduler<K> {
    config: KeepaliveConfig,
    queue: DelayQueue<(K, Timer)>,
    timers: HashMap<K, Timers>,
    stats: KeepaliveStats,
}

impl<K> KeepaliveScheduler<K>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Create a scheduler with the given timing.
    pub fn new(config: KeepaliveConfig) -> Self {
        let config = config.validated();
        debug!(
            interval_ms = config.ping_interval.as_millis() as u64,
            timeout_ms = config.ping_timeout.as_millis() as u64,
            "keepalive scheduler created"
        );
        Self {
            config,
            queue: DelayQueue::new(),
            timers: HashMap::new(),
            stats: KeepaliveStats::default(),
        }
    }

    /// Start both timers for `key`.
    ///
    /// The first ping fires one interval (plus jitter) from now; the
    /// timeout check fires `ping_timeout` after `last_seen`. Tracking a key
    /// that is already tracked restarts its timers.
    pub fn track(&mut self, key: K, last_seen: Instant) {
        if self.timers.contains_key(&key) {
            self.cancel(&key);
        }

        let jitter = self.first_ping_jitter();
        let ping = self.queue.insert_at(
            (key, Timer::Ping),
            Instant::now() + self.config.ping_interval + jitter,
        );
        let timeout = self.queue.insert_at(
            (key, Timer::Timeout),
            last_seen + self.config.ping_timeout,
        );
        self.timers.insert(
            key,
            Timers {
                ping,
                timeout: Some(timeout),
            },
        );
        trace!(?key, "keepalive timers started");
    }

    /// Stop all timers for `key`. Returns `true` if it was tracked.
    ///
    /// After this no event for `key` is ever yielded again, until it is
    /// tracked anew.
    pub fn cancel(&mut self, key: &K) -> bool {
        let Some(timers) = self.timers.remove(key) else {
            return false;
        };
        self.queue.remove(&timers.ping);
        if let Some(timeout) = timers.timeout {
            self.queue.remove(&timeout);
        }
        self.stats.cancelled += 1;
        trace!(?key, "keepalive timers cancelled");
        true
    }

    /// Stop every timer. Returns the keys that were tracked.
    pub fn cancel_all(&mut self) -> Vec<K> {
        self.queue.clear();
        let keys: Vec<K> = self.timers.drain().map(|(k, _)| k).collect();
        self.stats.cancelled += keys.len() as u64;
        keys
    }

    /// Re-arm the timeout check for `key` at `when`.
    ///
    /// Returns `false` if `key` is not tracked.
    pub fn check_again_at(&mut self, key: &K, when: Instant) -> bool {
        let Some(timers) = self.timers.get_mut(key) else {
            return false;
        };
        match &timers.timeout {
            Some(existing) => self.queue.reset_at(existing, when),
            None => {
                timers.timeout =
                    Some(self.queue.insert_at((*key, Timer::Timeout), when));
            }
        }
        true
    }

    /// Wait for the next timer to fire.
    ///
    /// Returns `None` immediately when nothing is tracked, so inside
    /// `tokio::select!` the branch is simply disabled for that iteration.
    ///
    /// Ping timers keep a fixed cadence: the next deadline is the previous
    /// deadline plus one interval. If the owner stalled past that, the
    /// cadence restarts from now rather than firing a burst.
    pub async fn next_event(&mut self) -> Option<KeepaliveEvent<K>> {
        loop {
            let expired = self.queue.next().await?;
            let deadline = expired.deadline();
            let (key, timer) = expired.into_inner();

            let Some(timers) = self.timers.get_mut(&key) else {
                continue;
            };

            match timer {
                Timer::Ping => {
                    let now = Instant::now();
                    let mut next = deadline + self.config.ping_interval;
                    if next <= now {
                        warn!(
                            ?key,
                            late_ms = now.saturating_duration_since(deadline).as_millis() as u64,
                            "ping timer overrun, restarting cadence"
                        );
                        next = now + self.config.ping_interval;
                    }
                    timers.ping = self.queue.insert_at((key, Timer::Ping), next);
                    self.stats.pings += 1;
                    trace!(?key, "ping timer fired");
                    return Some(KeepaliveEvent::Ping(key));
                }
                Timer::Timeout => {
                    timers.timeout = None;
                    self.stats.timeout_checks += 1;
                    trace!(?key, "timeout check fired");
                    return Some(KeepaliveEvent::TimeoutCheck(key));
                }
            }
        }
    }

    /// Whether `key` has live timers.
    pub fn is_tracked(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// The validated timing in use.
    pub fn config(&self) -> &KeepaliveConfig {
        &self.config
    }

    /// Counters since creation.
    pub fn stats(&self) -> &KeepaliveStats {
        &self.stats
    }

    fn first_ping_jitter(&self) -> Duration {
        let max_us = self.config.initial_ping_jitter.as_micros() as u64;
        if max_us == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..max_us))
    }
}
