//! Circuit breaker state machine.
//!
//! State transitions:
//! ```text
//! Closed ──(failure rate > threshold)──► Open ──(wait elapsed)──► HalfOpen
//!   ▲                                     ▲                          │
//!   └──────────(trials succeed)───────────┼──────────────────────────┤
//!                                         └──────(trial fails)───────┘
//! ```
//!
//! All transitions happen inside one critical section. Each transition bumps a
//! generation counter; outcomes reported through a [`Permit`] acquired under an
//! older generation are ignored, so a burst of late failures from calls admitted
//! while closed cannot re-trip a breaker that has already moved on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ConfigError;

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through; outcomes are recorded.
    Closed,

    /// Calls are rejected without invoking the operation.
    Open,

    /// A limited number of trial calls are admitted.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate in `(0.0, 1.0]` above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent calls kept in the rolling window.
    pub sliding_window_size: usize,
    /// Calls that must be recorded before the failure rate is evaluated.
    pub minimum_number_of_calls: usize,
    pub wait_duration_in_open_state: Duration,
    pub permitted_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 20,
            minimum_number_of_calls: 10,
            wait_duration_in_open_state: Duration::from_secs(30),
            permitted_calls_in_half_open_state: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn with_sliding_window(mut self, size: usize, minimum_calls: usize) -> Self {
        self.sliding_window_size = size;
        self.minimum_number_of_calls = minimum_calls;
        self
    }

    pub fn with_wait_duration(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    pub fn with_half_open_calls(mut self, calls: u32) -> Self {
        self.permitted_calls_in_half_open_state = calls;
        self
    }

    /// Checks that the configuration values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::InvalidFailureRate(self.failure_rate_threshold));
        }
        if self.minimum_number_of_calls == 0
            || self.sliding_window_size < self.minimum_number_of_calls
        {
            return Err(ConfigError::InvalidWindow {
                window: self.sliding_window_size,
                minimum: self.minimum_number_of_calls,
            });
        }
        if self.permitted_calls_in_half_open_state == 0 {
            return Err(ConfigError::InvalidHalfOpenCalls);
        }
        Ok(())
    }
}

/// A point-in-time view of a breaker, suitable for operators and APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently held in the rolling window.
    pub failure_count: u32,
    pub last_transition_at: DateTime<Utc>,
}

/// Returned when the breaker refuses to admit a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNotPermitted {
    pub name: String,
    pub state: CircuitState,
}

impl std::fmt::Display for CallNotPermitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit breaker '{}' is {}", self.name, self.state)
    }
}

impl std::error::Error for CallNotPermitted {}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    /// `true` marks a failed call.
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    last_transition_at: DateTime<Utc>,
}

/// A named circuit breaker shared by every caller of one protected operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker after checking `config`.
    pub fn try_new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(name, config))
    }

    /// Creates a closed breaker. The config is trusted as given; use
    /// [`CircuitBreaker::try_new`] for values read from the environment.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = VecDeque::with_capacity(config.sliding_window_size);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                window,
                failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                last_transition_at: Utc::now(),
            }),
        }
    }

    /// Returns the breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without performing any time-based transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns a snapshot of the breaker.
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: inner.state,
            failure_count: u32::try_from(inner.failures).unwrap_or(u32::MAX),
            last_transition_at: inner.last_transition_at,
        }
    }

    /// Asks the breaker to admit one call.
    ///
    /// An open breaker whose wait has elapsed moves to half-open here and admits
    /// the call as a trial.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CallNotPermitted> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.wait_duration_in_open_state)
                .unwrap_or(true);
            if elapsed {
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, inner.generation)),
            CircuitState::HalfOpen => {
                let admitted = inner.half_open_in_flight + inner.half_open_successes;
                if admitted < self.config.permitted_calls_in_half_open_state {
                    inner.half_open_in_flight += 1;
                    Ok(Permit::new(self, inner.generation))
                } else {
                    Err(self.reject(inner.state))
                }
            }
            CircuitState::Open => Err(self.reject(inner.state)),
        }
    }

    /// Forces the breaker back to closed and clears the window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn reject(&self, state: CircuitState) -> CallNotPermitted {
        metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.clone())
            .increment(1);
        CallNotPermitted {
            name: self.name.clone(),
            state,
        }
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => self.record(&mut inner, false),
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.permitted_calls_in_half_open_state {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                self.record(&mut inner, true);
                if inner.window.len() >= self.config.minimum_number_of_calls {
                    let rate = inner.failures as f64 / inner.window.len() as f64;
                    if rate > self.config.failure_rate_threshold {
                        tracing::warn!(
                            breaker = %self.name,
                            failure_rate = rate,
                            threshold = self.config.failure_rate_threshold,
                            "failure rate over threshold"
                        );
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn record(&self, inner: &mut Inner, failed: bool) {
        while inner.window.len() >= self.config.sliding_window_size.max(1) {
            if inner.window.pop_front() == Some(true) {
                inner.failures -= 1;
            }
        }
        inner.window.push_back(failed);
        if failed {
            inner.failures += 1;
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_transition_at = Utc::now();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;

        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
                inner.failures = 0;
            }
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        tracing::info!(breaker = %self.name, %from, %to, "circuit breaker transition");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission ticket for one call.
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`]. A permit
/// dropped without an outcome gives its half-open trial slot back.
#[must_use = "report the call outcome through the permit"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    reported: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64) -> Self {
        Self {
            breaker,
            generation,
            reported: false,
        }
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.generation);
    }

    /// Records a failed call.
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.on_abandoned(self.generation);
        }
    }
}

/// Hands out one shared breaker per protected operation name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers use `default_config` unless told otherwise.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry after checking `default_config`.
    pub fn try_new(default_config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self::new(default_config))
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Returns the breaker for `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        {
            let breakers = self
                .breakers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(breaker) = breakers.get(name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Returns snapshots of every registered breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let breakers = self
            .breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
