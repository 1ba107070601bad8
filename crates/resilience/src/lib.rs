//! Resilience policies for calls to unreliable dependencies.
//!
//! A [`PolicyExecutor`] composes two sub-policies:
//! 1. a [`CircuitBreaker`] (outermost) that fast-fails while a dependency is unhealthy
//! 2. a [`RetryPolicy`] (innermost) with exponential backoff and jitter
//!
//! Only failures classified as transient (see [`Classify`]) are retried.
//! Each attempt can be bounded by a per-call timeout.

pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod retry;

pub use circuit_breaker::{
    CallNotPermitted, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState, Permit,
};
pub use error::{AttemptError, Classify, ConfigError, Failure, FailureKind};
pub use executor::{PolicyExecutor, ResiliencePolicy};
pub use retry::RetryPolicy;
