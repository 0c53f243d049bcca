//! Circuit breaker guarding the shared remote classification service.
//!
//! One instance is shared (via `Arc`) by every evaluator talking to the same
//! remote credential. Only rate-limit-class failures move the breaker; other
//! errors are reported upward without counting against it.
//!
//! All check-and-transition logic runs under one exclusive lock, so two
//! callers can never both observe `Open` and independently move to
//! `HalfOpen`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::obs;
use crate::remote::ClassifyError;

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive rate-limit failures that open the breaker.
    pub failure_threshold: u32,
    /// Seconds to stay open before probing.
    pub recovery_timeout_secs: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Calls admitted per half-open episode.
    pub max_half_open_requests: u32,
    /// Case-insensitive message signatures of rate-limit errors.
    pub rate_limit_keywords: Vec<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 120,
            success_threshold: 3,
            max_half_open_requests: 3,
            rate_limit_keywords: [
                "rate_limit",
                "quota_exceeded",
                "too_many_requests",
                "rate limit",
                "limit exceeded",
                "throttled",
                "rate limiting",
                "usage limit",
                "api limit",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Time source for the breaker.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Move the clock backwards (simulates a skewed reading).
    pub fn rewind(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset = offset.saturating_sub(by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.origin + offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_half_open_successes: u32,
    pub half_open_slots_remaining: u32,
    /// Time left before an open breaker admits a probe.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_half_open_successes: u32,
    half_open_slots_remaining: u32,
    last_transition: Option<Instant>,
    // Bumped on every transition; tags admissions.
    epoch: u64,
}

/// Ticket for one admitted call, tied to the breaker state that admitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    epoch: u64,
}

/// Thread-safe three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    keywords: Vec<String>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker reading the system clock.
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let keywords = config
            .rate_limit_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        Self {
            config,
            keywords,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_half_open_successes: 0,
                half_open_slots_remaining: 0,
                last_transition: None,
                epoch: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether a call may be sent now. Admission while half-open consumes a slot.
    pub fn can_execute(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`can_execute`](Self::can_execute), returning the admission to
    /// report the outcome against.
    pub fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        let now = self.observe(&inner);

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.recovery_elapsed(&inner, now) {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    take_half_open_slot(&mut inner)
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if take_half_open_slot(&mut inner) {
                    true
                } else if self.recovery_elapsed(&inner, now) {
                    // Exhausted probes behave as Open; re-arm after another window.
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    take_half_open_slot(&mut inner)
                } else {
                    false
                }
            }
        };
        admitted.then_some(Admission { epoch: inner.epoch })
    }

    /// Record a successful remote call.
    ///
    /// Without an admission every success counts toward closing a half-open
    /// breaker; prefer [`record_success_of`](Self::record_success_of).
    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.apply_success(&mut inner);
    }

    /// Record the success of an admitted call. While half-open, only calls
    /// admitted as probes of the current half-open window count.
    pub fn record_success_of(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && admission.epoch != inner.epoch {
            tracing::debug!("ignoring success of a call admitted before half-open");
            return;
        }
        self.apply_success(&mut inner);
    }

    fn apply_success(&self, inner: &mut Inner) {
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures > 0 {
                    tracing::debug!("breaker failure count reset after success");
                }
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_half_open_successes += 1;
                tracing::debug!(
                    successes = inner.consecutive_half_open_successes,
                    threshold = self.config.success_threshold,
                    "half-open success"
                );
                if inner.consecutive_half_open_successes >= self.config.success_threshold {
                    let now = self.observe(inner);
                    self.transition(inner, CircuitState::Closed, now);
                }
            }
            // Late completion of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    /// Record a failed remote call.
    ///
    /// Returns `true` when `err` is rate-limit-class; only those move the
    /// breaker.
    pub fn record_failure(&self, err: &ClassifyError) -> bool {
        if !self.is_rate_limit(err) {
            return false;
        }

        let mut inner = self.lock();
        let now = self.observe(&inner);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                tracing::debug!(
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "rate-limit failure recorded"
                );
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
        true
    }

    /// Whether `err` carries a rate-limit signature.
    pub fn is_rate_limit(&self, err: &ClassifyError) -> bool {
        if matches!(err, ClassifyError::RateLimited { .. }) {
            return true;
        }
        let message = err.to_string().to_lowercase();
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let now = self.observe(&inner);
        let retry_after = match (inner.state, inner.last_transition) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout()
                    .saturating_sub(now.saturating_duration_since(at)),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_half_open_successes: inner.consecutive_half_open_successes,
            half_open_slots_remaining: inner.half_open_slots_remaining,
            retry_after,
        }
    }

    /// Open the breaker regardless of its counters.
    pub fn force_open(&self, reason: &str) {
        let mut inner = self.lock();
        let now = self.observe(&inner);
        tracing::warn!(reason, "circuit breaker forced open");
        self.transition(&mut inner, CircuitState::Open, now);
    }

    /// Close the breaker regardless of its counters.
    pub fn force_close(&self, reason: &str) {
        let mut inner = self.lock();
        let now = self.observe(&inner);
        tracing::warn!(reason, "circuit breaker forced closed");
        self.transition(&mut inner, CircuitState::Closed, now);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current time, clamped so it never precedes the last transition.
    fn observe(&self, inner: &Inner) -> Instant {
        let now = self.clock.now();
        match inner.last_transition {
            Some(last) if now < last => last,
            _ => now,
        }
    }

    fn recovery_elapsed(&self, inner: &Inner, now: Instant) -> bool {
        match inner.last_transition {
            Some(at) => now.saturating_duration_since(at) >= self.config.recovery_timeout(),
            None => true,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.epoch += 1;
        inner.last_transition = Some(now);
        inner.consecutive_half_open_successes = 0;
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_slots_remaining = 0;
            }
            CircuitState::Open => {
                inner.half_open_slots_remaining = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_slots_remaining = self.config.max_half_open_requests;
            }
        }
        if from != to {
            obs::emit_breaker_transition(from, to, inner.consecutive_failures);
        }
    }
}

fn take_half_open_slot(inner: &mut Inner) -> bool {
    if inner.half_open_slots_remaining > 0 {
        inner.half_open_slots_remaining -= 1;
        true
    } else {
        false
    }
}
