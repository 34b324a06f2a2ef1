//! Pipeline configuration
//!
//! Consumed once at construction time; the CLI maps its arguments onto
//! [`LookupConfig`] in `main.rs`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default sustained upstream request rate (tokens per second)
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 5.0;

/// Default token bucket burst capacity
pub const DEFAULT_BURST_CAPACITY: u32 = 10;

/// Default retry budget per job (including the first attempt)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of dispatcher workers
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Configuration for the lookup pipeline.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Whether upstream lookups are enabled at all. Cache hits still serve
    /// when disabled; misses resolve to `Error::Disabled`.
    pub enabled: bool,

    /// API key sent to the upstream catalog (if it requires one)
    pub api_key: Option<String>,

    /// Base URL of the upstream catalog API
    pub base_url: String,

    /// Sustained upstream call rate (token refill per second)
    pub requests_per_second: f64,

    /// Token bucket capacity (burst allowance)
    pub burst_capacity: u32,

    /// Maximum attempts per job before a transient failure becomes terminal
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff
    pub backoff_base: Duration,

    /// Upper bound on a single backoff delay
    pub backoff_cap: Duration,

    /// Per-attempt timeout on the upstream call
    pub attempt_timeout: Duration,

    /// Number of concurrent dispatcher workers
    pub worker_count: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://openlibrary.org".to_string(),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_capacity: DEFAULT_BURST_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

impl LookupConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_second <= 0.0 {
            return Err(Error::Config("requests_per_second must be > 0".into()));
        }
        if self.burst_capacity == 0 {
            return Err(Error::Config("burst_capacity must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be > 0".into()));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::Config("backoff_base must be > 0".into()));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(Error::Config("backoff_cap must be >= backoff_base".into()));
        }
        if self.base_url.is_empty() {
            return Err(Error::Config("base_url must not be empty".into()));
        }
        Ok(())
    }

    /// Backoff delay for the given attempt number (1-based), exponential
    /// with cap: `base * 2^attempts`.
    pub fn backoff_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}
