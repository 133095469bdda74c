//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by temporarily blocking requests to failing
//! backend instances. One breaker exists per instance.
//!
//! The state and the instant it was entered share one `AtomicU64` so a
//! reader never pairs a state with the timestamp of another one.

use crate::domain::value_objects::CircuitState;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Successes in half-open needed to close the circuit
    pub success_threshold: u32,
    /// Duration to keep circuit open before trial requests
    pub recovery_timeout: Duration,
    /// Concurrent trial requests allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

const STATE_SHIFT: u32 = 62;
const SINCE_MASK: u64 = (1 << STATE_SHIFT) - 1;

fn pack(state: CircuitState, since_ms: u64) -> u64 {
    let bits = match state {
        CircuitState::Closed => 0u64,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    };
    (bits << STATE_SHIFT) | (since_ms & SINCE_MASK)
}

fn unpack(word: u64) -> (CircuitState, u64) {
    let state = match word >> STATE_SHIFT {
        0 => CircuitState::Closed,
        1 => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    };
    (state, word & SINCE_MASK)
}

/// Get the current monotonic timestamp in milliseconds.
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Circuit breaker for one backend instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Packed (state, entered_at_ms)
    word: AtomicU64,
    /// Consecutive failures while closed
    failures: AtomicU32,
    /// Successes while half-open
    successes: AtomicU32,
    /// Trial requests currently in flight
    trials: AtomicU32,
    /// Label used in logs
    label: String,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(label: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            word: AtomicU64::new(pack(CircuitState::Closed, now_ms())),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            trials: AtomicU32::new(0),
            label: label.into(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current stored state. An open circuit past its recovery timeout
    /// still reads `Open` until the next trial moves it to half-open.
    pub fn state(&self) -> CircuitState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    fn recovery_elapsed(&self, since_ms: u64) -> bool {
        now_ms().saturating_sub(since_ms) >= self.config.recovery_timeout.as_millis() as u64
    }

    /// Whether the circuit is open and still inside its recovery timeout.
    pub fn is_ejecting(&self) -> bool {
        let (state, since) = unpack(self.word.load(Ordering::Acquire));
        state == CircuitState::Open && !self.recovery_elapsed(since)
    }

    /// Whether the circuit would let a request through now.
    ///
    /// `probe_healthy` only matters while closed: trial traffic is allowed
    /// regardless of probe health.
    pub fn admits(&self, probe_healthy: bool) -> bool {
        let (state, since) = unpack(self.word.load(Ordering::Acquire));
        match state {
            CircuitState::Closed => probe_healthy,
            CircuitState::Open => self.recovery_elapsed(since),
            CircuitState::HalfOpen => {
                self.trials.load(Ordering::Acquire) < self.config.half_open_max_requests
            }
        }
    }

    /// Ask permission to send a request.
    ///
    /// Returns `None` when the circuit is open, or half-open with every
    /// trial slot taken. An open circuit past its recovery timeout moves
    /// to half-open here.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CircuitPermit> {
        loop {
            let word = self.word.load(Ordering::Acquire);
            let (state, since) = unpack(word);

            match state {
                CircuitState::Closed => {
                    return Some(CircuitPermit::new(self.clone(), false));
                }
                CircuitState::Open => {
                    if !self.recovery_elapsed(since) {
                        return None;
                    }
                    let half_open = pack(CircuitState::HalfOpen, now_ms());
                    if self
                        .word
                        .compare_exchange(word, half_open, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.successes.store(0, Ordering::Release);
                        self.trials.store(0, Ordering::Release);
                        tracing::info!("circuit breaker for {} transitioning to half-open", self.label);
                    }
                    // Re-read and claim a slot as half-open
                }
                CircuitState::HalfOpen => {
                    let max = self.config.half_open_max_requests;
                    let claimed = self
                        .trials
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                            if n < max {
                                Some(n + 1)
                            } else {
                                None
                            }
                        })
                        .is_ok();
                    return claimed.then(|| CircuitPermit::new(self.clone(), true));
                }
            }
        }
    }

    fn transition(&self, from: u64, to: CircuitState) -> bool {
        self.word
            .compare_exchange(from, pack(to, now_ms()), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a successful request.
    ///
    /// Returns the new state when this call closed the circuit.
    pub fn record_success(&self) -> Option<CircuitState> {
        let word = self.word.load(Ordering::Acquire);
        let (state, _) = unpack(word);

        match state {
            CircuitState::Closed => {
                // Reset failure count on success
                self.failures.store(0, Ordering::Release);
                None
            }
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold && self.transition(word, CircuitState::Closed) {
                    self.failures.store(0, Ordering::Release);
                    self.successes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker for {} closed (recovered)", self.label);
                    return Some(CircuitState::Closed);
                }
                None
            }
            // A request that started before the circuit re-opened
            CircuitState::Open => None,
        }
    }

    /// Record a failed request or probe.
    ///
    /// Returns the new state when this call opened the circuit.
    pub fn record_failure(&self) -> Option<CircuitState> {
        let word = self.word.load(Ordering::Acquire);
        let (state, _) = unpack(word);

        match state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold && self.transition(word, CircuitState::Open) {
                    tracing::warn!(
                        "circuit breaker for {} opened after {} failures",
                        self.label,
                        failures
                    );
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately re-opens
                if self.transition(word, CircuitState::Open) {
                    self.successes.store(0, Ordering::Release);
                    tracing::warn!("circuit breaker for {} re-opened (failed in half-open)", self.label);
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    /// A passing probe clears the closed-circuit failure streak.
    pub fn record_probe_success(&self) {
        if self.state() == CircuitState::Closed {
            self.failures.store(0, Ordering::Release);
        }
    }

    fn release_trial(&self) {
        let _ = self
            .trials
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Manually reset the circuit to closed.
    pub fn reset(&self) {
        self.word
            .store(pack(CircuitState::Closed, now_ms()), Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.trials.store(0, Ordering::Release);
        tracing::info!("circuit breaker for {} manually reset", self.label);
    }

    /// Get metrics for this circuit.
    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            state: self.state(),
            failures: self.failures.load(Ordering::Acquire),
            successes: self.successes.load(Ordering::Acquire),
            trials_in_flight: self.trials.load(Ordering::Acquire),
        }
    }
}

/// Metrics for a circuit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub trials_in_flight: u32,
}

/// Permission to send one request through a breaker.
///
/// Resolve it with [`CircuitPermit::success`] or [`CircuitPermit::failure`].
/// Dropping it unresolved (the request was cancelled) frees a half-open
/// trial slot without counting an outcome.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit holds a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) -> Option<CircuitState> {
        self.resolve();
        self.breaker.record_success()
    }

    pub fn failure(mut self) -> Option<CircuitState> {
        self.resolve();
        self.breaker.record_failure()
    }

    fn resolve(&mut self) {
        self.resolved = true;
        if self.trial {
            self.breaker.release_trial();
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
