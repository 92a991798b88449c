use std::path::PathBuf;
use std::time::Duration;

use crate::advisory::AdvisoryLockConfig;
use crate::booking::BookingPolicy;
use crate::model::Ms;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Process configuration, read from `SLOTGUARD_*` variables. Missing or
/// unparsable values keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_exponential: bool,
    pub retry_max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    /// 0 disables the overall deadline.
    pub booking_deadline_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout_ms: u64,
    pub lock_bucket_ms: Ms,
    pub lock_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("SLOTGUARD_DATA_DIR")
            && !value.is_empty()
        {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("SLOTGUARD_METRICS_PORT")
            && let Ok(parsed) = value.parse::<u16>()
        {
            config.metrics_port = Some(parsed);
        }
        if let Some(value) = lookup("SLOTGUARD_COMPACT_THRESHOLD")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.compact_threshold = parsed.max(1);
        }
        if let Some(value) = lookup("SLOTGUARD_MAX_RETRIES")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.max_retries = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_RETRY_BASE_DELAY_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.retry_base_delay_ms = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_RETRY_EXPONENTIAL")
            && let Ok(parsed) = value.parse::<bool>()
        {
            config.retry_exponential = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_RETRY_MAX_DELAY_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.retry_max_delay_ms = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_ATTEMPT_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.attempt_timeout_ms = parsed.max(1);
        }
        if let Some(value) = lookup("SLOTGUARD_BOOKING_DEADLINE_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.booking_deadline_ms = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_CIRCUIT_FAILURE_THRESHOLD")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.circuit_failure_threshold = parsed.max(1);
        }
        if let Some(value) = lookup("SLOTGUARD_CIRCUIT_RESET_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.circuit_reset_timeout_ms = parsed;
        }
        if let Some(value) = lookup("SLOTGUARD_LOCK_BUCKET_MS")
            && let Ok(parsed) = value.parse::<Ms>()
        {
            config.lock_bucket_ms = parsed.max(1);
        }
        if let Some(value) = lookup("SLOTGUARD_LOCK_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.lock_timeout_ms = parsed;
        }

        config
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .exponential(self.retry_exponential)
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .build()
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            reset_timeout: Duration::from_millis(self.circuit_reset_timeout_ms),
        }
    }

    pub fn advisory_lock(&self) -> AdvisoryLockConfig {
        AdvisoryLockConfig {
            bucket_ms: self.lock_bucket_ms,
            acquire_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn booking_policy(&self) -> BookingPolicy {
        BookingPolicy {
            retry: self.retry_policy(),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            deadline: (self.booking_deadline_ms > 0)
                .then(|| Duration::from_millis(self.booking_deadline_ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            max_retries: 2,
            retry_base_delay_ms: 50,
            retry_exponential: true,
            retry_max_delay_ms: 2000,
            attempt_timeout_ms: 2000,
            booking_deadline_ms: 10_000,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_ms: 30_000,
            lock_bucket_ms: 60_000,
            lock_timeout_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_component_defaults() {
        let config = Config::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.circuit_breaker(), CircuitBreakerConfig::default());
        assert_eq!(config.advisory_lock(), AdvisoryLockConfig::default());
        assert_eq!(config.booking_policy(), BookingPolicy::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("SLOTGUARD_DATA_DIR", "/var/lib/slotguard"),
            ("SLOTGUARD_METRICS_PORT", "9100"),
            ("SLOTGUARD_MAX_RETRIES", "4"),
            ("SLOTGUARD_RETRY_EXPONENTIAL", "false"),
            ("SLOTGUARD_BOOKING_DEADLINE_MS", "0"),
            ("SLOTGUARD_LOCK_BUCKET_MS", "900000"),
        ]);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotguard"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.retry_policy().max_retries, 4);
        assert!(!config.retry_policy().exponential);
        assert_eq!(config.booking_policy().deadline, None);
        assert_eq!(config.advisory_lock().bucket_ms, 900_000);
    }

    #[test]
    fn garbage_and_zero_values_fall_back_or_clamp() {
        let config = from_pairs(&[
            ("SLOTGUARD_MAX_RETRIES", "many"),
            ("SLOTGUARD_METRICS_PORT", "99999"),
            ("SLOTGUARD_CIRCUIT_FAILURE_THRESHOLD", "0"),
            ("SLOTGUARD_LOCK_BUCKET_MS", "0"),
        ]);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.circuit_failure_threshold, 1);
        assert_eq!(config.lock_bucket_ms, 1);
    }
}
