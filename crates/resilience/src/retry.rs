//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Retry configuration.
///
/// The `k`-th retry (the wait before attempt `k + 1`) waits
/// `base_delay * multiplier^(k-1)`, randomised uniformly within
/// `±jitter_fraction` of that value and clamped to `[0, max_delay]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    /// Hard cap on any single delay, jitter included.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter_fraction: 0.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given number of attempts and default timing.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Checks that the policy values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::InvalidJitter(self.jitter_fraction));
        }
        Ok(())
    }

    /// Returns the deterministic delay before the given retry (1-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        if retry == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs > cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Returns the jittered delay before the given retry using `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(retry).as_secs_f64();
        if nominal == 0.0 || self.jitter_fraction <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }

        let spread = nominal * self.jitter_fraction;
        let low = (nominal - spread).max(0.0);
        let high = (nominal + spread).min(self.max_delay.as_secs_f64());
        if high <= low {
            return Duration::from_secs_f64(low);
        }
        Duration::from_secs_f64(rng.random_range(low..=high))
    }

    /// Returns the jittered delay before the given retry using the thread RNG.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.jittered_delay(retry, &mut rand::rng())
    }
}
