//! Per-upstream circuit breaker.
//!
//! ```text
//! Closed   -> Open      after `failure_threshold` consecutive failures
//! Open     -> HalfOpen  once `recovery_timeout` has passed since the last failure
//! HalfOpen -> Closed    when the single probe succeeds
//! HalfOpen -> Open      when the probe fails (recovery timer restarts)
//! ```
//!
//! All transitions for one breaker are serialized under its mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use marketops_core::{config::CircuitBreakerSettings, Error, Result};

use crate::retry::secs_to_delay;

/// Wait suggested to callers turned away while a half-open probe is running.
const PROBE_IN_FLIGHT_WAIT: Duration = Duration::from_secs(1);

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: closed=0, open=1, half_open=2.
    pub fn as_metric(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. At least 1.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            secs_to_delay(settings.recovery_timeout_secs),
        )
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker, for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub retry_after_secs: f64,
}

/// Failure-counting state machine gating calls to one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        };
        breaker.publish(CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the open → half-open timer.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Whether a call may proceed now. In half-open state only one caller
    /// at a time is admitted as the probe.
    pub fn call_allowed(&self) -> bool {
        self.admit().is_some()
    }

    /// Admit a call and return a permit that must be resolved with
    /// [`BreakerPermit::success`] or [`BreakerPermit::failure`].
    ///
    /// Returns `Error::CircuitOpen` with the remaining wait when rejected.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        match self.admit() {
            Some(probe) => Ok(BreakerPermit {
                breaker: self,
                probe,
                resolved: false,
            }),
            None => {
                let retry_after = self.get_retry_after();
                tracing::debug!(name = %self.name, retry_after_ms = retry_after.as_millis() as u64, "Call rejected by open circuit");
                Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.probe_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => inner.failure_count = 0,
            // A call admitted before the circuit opened; the open timer stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Time until a probe will be admitted; zero when calls are allowed now.
    pub fn get_retry_after(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => self.config.recovery_timeout.saturating_sub(at.elapsed()),
            (CircuitState::HalfOpen, _) if inner.probe_in_flight => {
                PROBE_IN_FLIGHT_WAIT.min(self.config.recovery_timeout)
            }
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (state, failure_count) = {
            let inner = self.lock();
            (inner.state, inner.failure_count)
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count,
            retry_after_secs: self.get_retry_after().as_secs_f64(),
        }
    }

    /// `Some(is_probe)` when admitted.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                Some(true)
            }
            CircuitState::HalfOpen if inner.probe_in_flight => None,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Some(true)
            }
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                name = %self.name,
                failures = inner.failure_count,
                recovery_timeout_secs = self.config.recovery_timeout.as_secs_f64(),
                "Circuit breaker OPENED"
            ),
            _ => tracing::info!(name = %self.name, from = from.as_str(), to = to.as_str(), "Circuit breaker transition"),
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "name" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        self.publish(to);
    }

    fn publish(&self, state: CircuitState) {
        metrics::gauge!("circuit_breaker_state", "name" => self.name.clone()).set(state.as_metric());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to call through a breaker.
///
/// Dropping a permit without resolving it (the caller was cancelled) frees
/// the half-open probe slot without counting a failure.
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Breakers keyed by upstream name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Breaker for `name`, created on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Snapshots sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
