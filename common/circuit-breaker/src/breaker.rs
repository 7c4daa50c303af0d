use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common_metrics::MetricsSink;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CIRCUIT_BREAKER_TRANSITIONS: &str = "circuit_breaker_transitions_total";
pub const CIRCUIT_BREAKER_REJECTED: &str = "circuit_breaker_rejected_total";
pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }

    fn as_gauge(&self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::Open => 1.0,
            CircuitBreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Trial calls allowed through at once while half-open.
    pub max_requests: u32,
    /// How often the closed-state counts are cleared. Zero never clears them.
    pub interval: Duration,
    /// How long the breaker stays open before letting trial calls through.
    pub timeout: Duration,
    /// Consecutive failures required before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio over the current window required to trip.
    pub failure_ratio: f64,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            min_requests: 3,
            failure_ratio: 0.5,
            success_threshold: 1,
        }
    }
}

/// Call outcomes recorded since the last state change or interval reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("call to {0} canceled")]
    Canceled(String),
    #[error("circuit breaker {0} is open")]
    Open(String),
    #[error("circuit breaker {0} is half-open and out of trial calls")]
    TooManyRequests(String),
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call without running it.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            BreakerError::Open(_) | BreakerError::TooManyRequests(_)
        )
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

struct Inner {
    state: CircuitBreakerState,
    // Bumped on every transition, outcomes of calls started in an older
    // generation are ignored
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    changed_at: Instant,
    trials_in_flight: u32,
}

/// Three-state breaker guarding calls to one downstream dependency.
///
/// Counters are shared by every caller and kept behind an internal lock, the
/// wrapped call itself runs without holding it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_owned(),
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: closed_expiry(&config, now),
                changed_at: now,
                trials_in_flight: 0,
            }),
            config,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now())
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// When the breaker last changed state.
    pub fn last_transition(&self) -> Instant {
        self.lock().changed_at
    }

    /// Run `f` through the breaker, unless `cancel` already fired. A call
    /// rejected by the breaker never invokes `f`. Cancellation while `f` runs,
    /// or dropping the returned future, abandons the call without counting it.
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(BreakerError::Canceled(self.name.clone()));
        }

        let call = self.before_call()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BreakerError::Canceled(self.name.clone())),
            result = f() => {
                call.finish(result.is_ok());
                result.map_err(BreakerError::Inner)
            }
        }
    }

    /// `execute` for callers without a cancellation signal.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = self.before_call()?;
        let result = f().await;
        call.finish(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_call<E>(&self) -> Result<PendingCall<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        let state = self.current_state(&mut inner, Instant::now());

        match state {
            CircuitBreakerState::Open => {
                self.reject(state);
                return Err(BreakerError::Open(self.name.clone()));
            }
            CircuitBreakerState::HalfOpen => {
                if inner.trials_in_flight >= self.config.max_requests {
                    self.reject(state);
                    return Err(BreakerError::TooManyRequests(self.name.clone()));
                }
                inner.trials_in_flight += 1;
            }
            CircuitBreakerState::Closed => {}
        }

        inner.counts.on_request();
        Ok(PendingCall {
            breaker: self,
            generation: inner.generation,
            finished: false,
        })
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);
        if generation != inner.generation {
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    // A call that never reported an outcome gives back its request and, when
    // half-open, its trial slot.
    fn abandon(&self, generation: u64) {
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }
        inner.counts.requests = inner.counts.requests.saturating_sub(1);
        if inner.state == CircuitBreakerState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    fn on_success(&self, inner: &mut Inner, state: CircuitBreakerState, now: Instant) {
        match state {
            CircuitBreakerState::Closed => inner.counts.on_success(),
            CircuitBreakerState::HalfOpen => {
                inner.counts.on_success();
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                if inner.counts.consecutive_successes >= self.config.success_threshold {
                    self.set_state(inner, CircuitBreakerState::Closed, now);
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, state: CircuitBreakerState, now: Instant) {
        match state {
            CircuitBreakerState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitBreakerState::Open, now);
                }
            }
            CircuitBreakerState::HalfOpen => {
                self.set_state(inner, CircuitBreakerState::Open, now);
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.consecutive_failures >= self.config.min_requests
            && counts.failure_ratio() >= self.config.failure_ratio
    }

    // Applies the time-driven transitions: the closed window reset and the
    // end of the open period.
    fn current_state(&self, inner: &mut Inner, now: Instant) -> CircuitBreakerState {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitBreakerState::Closed if expired => self.new_generation(inner, now),
            CircuitBreakerState::Open if expired => {
                self.set_state(inner, CircuitBreakerState::HalfOpen, now)
            }
            _ => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitBreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        let counts = inner.counts;
        inner.state = to;
        inner.changed_at = now;
        self.new_generation(inner, now);

        match to {
            CircuitBreakerState::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                requests = counts.requests,
                failures = counts.total_failures,
                consecutive_failures = counts.consecutive_failures,
                "circuit breaker opened"
            ),
            _ => info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state changed"
            ),
        }

        let name = ("name".to_string(), self.name.clone());
        self.metrics.inc(
            CIRCUIT_BREAKER_TRANSITIONS,
            &[
                name.clone(),
                ("from".to_string(), from.as_str().to_string()),
                ("to".to_string(), to.as_str().to_string()),
            ],
            1,
        );
        self.metrics
            .gauge(CIRCUIT_BREAKER_STATE, &[name], to.as_gauge());
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.trials_in_flight = 0;
        inner.expiry = match inner.state {
            CircuitBreakerState::Closed => closed_expiry(&self.config, now),
            CircuitBreakerState::Open => Some(now + self.config.timeout),
            CircuitBreakerState::HalfOpen => None,
        };
    }

    fn reject(&self, state: CircuitBreakerState) {
        self.metrics.inc(
            CIRCUIT_BREAKER_REJECTED,
            &[
                ("name".to_string(), self.name.clone()),
                ("state".to_string(), state.as_str().to_string()),
            ],
            1,
        );
    }
}

/// A call admitted by the breaker. Dropped before `finish`, for example when
/// the future running it is cancelled or timed out, the call is abandoned.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl PendingCall<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.abandon(self.generation);
        }
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    if config.interval.is_zero() {
        None
    } else {
        Some(now + config.interval)
    }
}
