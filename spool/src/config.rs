//! Pool configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// How long idle transformers are kept by default.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(60 * 60);

/// Minimum time between two reads of the modification source.
pub const DEFAULT_STALENESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Ceiling on checked-out transformers across all types.
    pub max_concurrent: usize,
    /// Retention window for idle lists, also the sweep period.
    /// `Duration::ZERO` disables the sweeper.
    pub cache_time: Duration,
    pub staleness_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            cache_time: DEFAULT_CACHE_TIME,
            staleness_interval: DEFAULT_STALENESS_INTERVAL,
        }
    }
}

impl PoolConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    /// Read overrides from `SPOOL_MAX_CONCURRENT`, `SPOOL_CACHE_TIME_MS` and
    /// `SPOOL_STALENESS_INTERVAL_MS`. Unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("SPOOL_MAX_CONCURRENT") {
            match raw.trim().parse::<usize>() {
                Ok(n) => config.max_concurrent = n,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid SPOOL_MAX_CONCURRENT")
                }
            }
        }

        if let Some(raw) = lookup("SPOOL_CACHE_TIME_MS") {
            match raw.trim().parse::<i64>() {
                Ok(ms) => config.cache_time = cache_time_from_millis(ms),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid SPOOL_CACHE_TIME_MS")
                }
            }
        }

        if let Some(raw) = lookup("SPOOL_STALENESS_INTERVAL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.staleness_interval = Duration::from_millis(ms),
                Err(e) => tracing::warn!(
                    value = %raw,
                    error = %e,
                    "Ignoring invalid SPOOL_STALENESS_INTERVAL_MS"
                ),
            }
        }

        config
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Signed milliseconds, where anything `<= 0` disables sweeping.
    pub fn with_cache_time_millis(mut self, ms: i64) -> Self {
        self.cache_time = cache_time_from_millis(ms);
        self
    }

    pub fn with_staleness_interval(mut self, interval: Duration) -> Self {
        self.staleness_interval = interval;
        self
    }

    pub fn sweeping_enabled(&self) -> bool {
        !self.cache_time.is_zero()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.staleness_interval.is_zero() {
            return Err(ConfigError::ZeroStalenessInterval);
        }
        Ok(())
    }
}

fn cache_time_from_millis(ms: i64) -> Duration {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}
