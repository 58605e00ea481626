//! Coordinator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default lifetime of execution leases and participant reservations (30 minutes).
pub const DEFAULT_LEASE_EXPIRY: Duration = Duration::from_millis(1_800_000);

/// How Confirm calls are issued across the participants of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmParallelism {
    /// One participant after another, in registration order.
    Sequential,
    /// All participants at once.
    #[default]
    Parallel,
}

impl FromStr for ConfirmParallelism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ConfirmParallelism::Sequential),
            "parallel" => Ok(ConfirmParallelism::Parallel),
            other => Err(format!("unknown confirm parallelism: {other}")),
        }
    }
}

/// Coordinator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `TCC_MAX_RETRIES` (default: `5`)
/// - `TCC_BACKOFF_BASE_MS` (default: `500`)
/// - `TCC_BACKOFF_FACTOR` (default: `2.0`)
/// - `TCC_MAX_BACKOFF_MS` (default: `60000`)
/// - `TCC_CONFIRM_PARALLELISM`, `sequential` or `parallel` (default: `parallel`)
/// - `TCC_LEASE_EXPIRY_MS` (default: `1800000`)
/// - `TCC_CALL_TIMEOUT_MS` (default: `5000`)
/// - `TCC_RETRY_WORKERS` (default: `4`)
/// - `TCC_MAX_IN_FLIGHT_CALLS` (default: `64`)
/// - `TCC_INSTANCE_ID` (default: `coordinator-<random uuid>`)
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Retries allowed after the first Confirm/Cancel attempt of a participant.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub confirm_parallelism: ConfirmParallelism,
    /// Lifetime of the execution lease taken on commit and recovery.
    pub lease_expiry: Duration,
    /// Per participant call; a timed-out Try counts as a Try failure.
    pub call_timeout: Duration,
    pub retry_workers: usize,
    pub max_in_flight_calls: usize,
    /// Lease owner name. A restarted instance reusing its ID can reclaim its own leases.
    pub instance_id: String,
}

impl CoordinatorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("TCC_MAX_RETRIES", defaults.max_retries),
            backoff_base: env_millis_or("TCC_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_factor: env_or("TCC_BACKOFF_FACTOR", defaults.backoff_factor),
            max_backoff: env_millis_or("TCC_MAX_BACKOFF_MS", defaults.max_backoff),
            confirm_parallelism: env_or("TCC_CONFIRM_PARALLELISM", defaults.confirm_parallelism),
            lease_expiry: env_millis_or("TCC_LEASE_EXPIRY_MS", defaults.lease_expiry),
            call_timeout: env_millis_or("TCC_CALL_TIMEOUT_MS", defaults.call_timeout),
            retry_workers: env_or("TCC_RETRY_WORKERS", defaults.retry_workers).max(1),
            max_in_flight_calls: env_or("TCC_MAX_IN_FLIGHT_CALLS", defaults.max_in_flight_calls)
                .max(1),
            instance_id: std::env::var("TCC_INSTANCE_ID").unwrap_or(defaults.instance_id),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, factor: f64) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor;
        self
    }

    pub fn with_confirm_parallelism(mut self, parallelism: ConfirmParallelism) -> Self {
        self.confirm_parallelism = parallelism;
        self
    }

    pub fn with_lease_expiry(mut self, lease_expiry: Duration) -> Self {
        self.lease_expiry = lease_expiry;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Returns the retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            backoff_factor: self.backoff_factor,
            max_backoff: self.max_backoff,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            confirm_parallelism: ConfirmParallelism::Parallel,
            lease_expiry: DEFAULT_LEASE_EXPIRY,
            call_timeout: Duration::from_secs(5),
            retry_workers: 4,
            max_in_flight_calls: 64,
            instance_id: format!("coordinator-{}", uuid::Uuid::new_v4()),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis_or(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
