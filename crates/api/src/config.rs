//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use outbox::RelayConfig;
use resilience::{CircuitBreakerConfig, ConfigError, ResiliencePolicy, RetryPolicy};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `RELAY_BATCH_SIZE`, `RELAY_POLL_INTERVAL_MS`, `RELAY_LEASE_MS`
/// - `OUTBOX_RETENTION_SECS`, `IDEMPOTENCY_RETENTION_SECS`
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_DELAY_MS`, `RETRY_MULTIPLIER`,
///   `RETRY_JITTER`, `CALL_TIMEOUT_MS`
/// - `BREAKER_FAILURE_RATE`, `BREAKER_WINDOW`, `BREAKER_MIN_CALLS`,
///   `BREAKER_OPEN_WAIT_MS`, `BREAKER_HALF_OPEN_CALLS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,

    pub relay_batch_size: usize,
    pub relay_poll_interval: Duration,
    pub relay_lease: Duration,
    pub outbox_retention: Duration,
    pub idempotency_retention: Duration,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,
    pub call_timeout: Duration,

    pub breaker_failure_rate: f64,
    pub breaker_window: usize,
    pub breaker_min_calls: usize,
    pub breaker_open_wait: Duration,
    pub breaker_half_open_calls: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// Unparseable values fall back to their defaults. Parsed values that
    /// form an unusable retry or breaker policy are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &str| Var(lookup(name));

        let config = Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse("PORT").or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),

            relay_batch_size: parse("RELAY_BATCH_SIZE").or(defaults.relay_batch_size),
            relay_poll_interval: parse("RELAY_POLL_INTERVAL_MS").millis_or(defaults.relay_poll_interval),
            relay_lease: parse("RELAY_LEASE_MS").millis_or(defaults.relay_lease),
            outbox_retention: parse("OUTBOX_RETENTION_SECS").secs_or(defaults.outbox_retention),
            idempotency_retention: parse("IDEMPOTENCY_RETENTION_SECS")
                .secs_or(defaults.idempotency_retention),

            retry_max_attempts: parse("RETRY_MAX_ATTEMPTS").or(defaults.retry_max_attempts),
            retry_base_delay: parse("RETRY_BASE_DELAY_MS").millis_or(defaults.retry_base_delay),
            retry_multiplier: parse("RETRY_MULTIPLIER").or(defaults.retry_multiplier),
            retry_jitter: parse("RETRY_JITTER").or(defaults.retry_jitter),
            call_timeout: parse("CALL_TIMEOUT_MS").millis_or(defaults.call_timeout),

            breaker_failure_rate: parse("BREAKER_FAILURE_RATE").or(defaults.breaker_failure_rate),
            breaker_window: parse("BREAKER_WINDOW").or(defaults.breaker_window),
            breaker_min_calls: parse("BREAKER_MIN_CALLS").or(defaults.breaker_min_calls),
            breaker_open_wait: parse("BREAKER_OPEN_WAIT_MS").millis_or(defaults.breaker_open_wait),
            breaker_half_open_calls: parse("BREAKER_HALF_OPEN_CALLS")
                .or(defaults.breaker_half_open_calls),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the retry policy and breaker settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resilience_policy().validate()?;
        self.breaker_config().validate()
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resilience_policy(&self) -> ResiliencePolicy {
        let retry = RetryPolicy::new(self.retry_max_attempts)
            .with_base_delay(self.retry_base_delay)
            .with_multiplier(self.retry_multiplier)
            .with_jitter(self.retry_jitter);
        ResiliencePolicy::new(retry).with_call_timeout(self.call_timeout)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_rate_threshold(self.breaker_failure_rate)
            .with_sliding_window(self.breaker_window, self.breaker_min_calls)
            .with_wait_duration(self.breaker_open_wait)
            .with_half_open_calls(self.breaker_half_open_calls)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .with_batch_size(self.relay_batch_size)
            .with_poll_interval(self.relay_poll_interval)
            .with_lease(self.relay_lease)
            .with_retention(Some(self.outbox_retention))
    }
}

/// A raw variable value awaiting parsing.
struct Var(Option<String>);

impl Var {
    fn or<T: FromStr>(self, default: T) -> T {
        self.0
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis_or(self, default: Duration) -> Duration {
        self.0
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    fn secs_or(self, default: Duration) -> Duration {
        self.0
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,

            relay_batch_size: 100,
            relay_poll_interval: Duration::from_millis(500),
            relay_lease: Duration::from_millis(30_000),
            outbox_retention: Duration::from_secs(86_400),
            idempotency_retention: Duration::from_secs(86_400),

            retry_max_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_multiplier: 2.0,
            retry_jitter: 0.5,
            call_timeout: Duration::from_millis(2_000),

            breaker_failure_rate: 0.5,
            breaker_window: 20,
            breaker_min_calls: 10,
            breaker_open_wait: Duration::from_millis(30_000),
            breaker_half_open_calls: 1,
        }
    }
}
