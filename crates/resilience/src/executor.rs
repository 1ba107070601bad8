//! Policy executor composing the circuit breaker with retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::error::{AttemptError, Classify, ConfigError, Failure};
use crate::retry::RetryPolicy;

/// Retry and timeout settings applied to every execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    pub retry: RetryPolicy,
    /// Bound on each individual attempt, independent of backoff timing.
    pub call_timeout: Option<Duration>,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl ResiliencePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()
    }
}

/// Executes operations through a shared circuit breaker and a retry policy.
///
/// The breaker is consulted once per execution (outermost) and sees the
/// outcome of the whole retry sequence. Between attempts the executor checks
/// whether another caller has opened the breaker in the meantime and stops
/// retrying if so.
#[derive(Debug, Clone)]
pub struct PolicyExecutor {
    breaker: Arc<CircuitBreaker>,
    policy: ResiliencePolicy,
}

impl PolicyExecutor {
    /// Creates an executor around a shared breaker.
    pub fn new(breaker: Arc<CircuitBreaker>, policy: ResiliencePolicy) -> Self {
        Self { breaker, policy }
    }

    /// Creates an executor using the registry's breaker for `name`.
    pub fn from_registry(
        registry: &CircuitBreakerRegistry,
        name: &str,
        policy: ResiliencePolicy,
    ) -> Self {
        Self::new(registry.get_or_create(name), policy)
    }

    /// Returns the breaker guarding this executor.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the policy.
    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Runs `operation` under the breaker and retry policy.
    ///
    /// `operation` is called once per attempt and must be safe to repeat.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let permit = self.breaker.try_acquire().map_err(|rejected| {
            tracing::debug!(breaker = %rejected.name, state = %rejected.state, "call rejected");
            Failure::CircuitOpen {
                name: rejected.name,
            }
        })?;

        let outcome = self.run_attempts(&mut operation).await;
        match &outcome {
            // The dependency answered; a client-side error says nothing about its health.
            Ok(_) | Err(Failure::NonTransient(_)) => permit.success(),
            Err(Failure::RetriesExhausted { .. }) => permit.failure(),
            Err(Failure::CircuitOpen { .. }) => drop(permit),
        }

        if let Err(failure) = &outcome {
            metrics::counter!(
                "resilience_failures_total",
                "breaker" => self.breaker.name().to_string(),
                "kind" => failure.kind().as_str()
            )
            .increment(1);
        }
        outcome
    }

    async fn run_attempts<T, E, F, Fut>(&self, operation: &mut F) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let name = self.breaker.name();
        let max_attempts = self.policy.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics::counter!("resilience_attempts_total", "breaker" => name.to_string())
                .increment(1);

            let result = match self.policy.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(AttemptError::Operation),
                    Err(_) => Err(AttemptError::Timeout(limit)),
                },
                None => operation().await.map_err(AttemptError::Operation),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(AttemptError::Operation(e)) if !e.is_transient() => {
                    tracing::debug!(breaker = %name, attempt, error = %e, "non-transient failure");
                    return Err(Failure::NonTransient(e));
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                tracing::warn!(breaker = %name, attempt, error = %error, "retries exhausted");
                return Err(Failure::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.retry.delay_for(attempt);
            tracing::debug!(
                breaker = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;

            if self.breaker.state() == CircuitState::Open {
                return Err(Failure::CircuitOpen {
                    name: name.to_string(),
                });
            }
        }
    }
}
