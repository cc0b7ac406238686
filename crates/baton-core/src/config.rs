// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Upper bound of `heartbeat_interval / lease_ttl`.
pub const MAX_RENEWAL_RATIO: f64 = 0.6;

const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
const DEFAULT_FAILURE_DETECTION_MULTIPLIER: f64 = 2.0;
const DEFAULT_RECOVERY_LOCK_TTL_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_PERIOD_MS: u64 = 30_000;
const DEFAULT_SCAN_INTERVAL_MS: u64 = 15_000;
const DEFAULT_SCAN_BATCH_SIZE: u32 = 100;
const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_JANITOR_INTERVAL_MS: u64 = 300_000;

/// Baton configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Lease length of execution and resource locks
    pub lease_ttl: Duration,
    /// How often a held lease is renewed (at most 0.6 x `lease_ttl`)
    pub heartbeat_interval: Duration,
    /// Staleness multiplier applied to `lease_ttl` by the failure detector
    pub failure_detection_multiplier: f64,
    /// Lease length of recovery locks
    pub recovery_lock_ttl: Duration,
    /// How long shutdown waits for in-flight steps
    pub shutdown_grace_period: Duration,
    /// Interval between failure-detector scans
    pub scan_interval: Duration,
    /// Maximum suspects returned by a single scan
    pub scan_batch_size: u32,
    /// Recovery attempts before an instance is failed
    pub max_recovery_attempts: u32,
    /// Interval between expired-lock reaping passes
    pub janitor_interval: Duration,
}

impl Config {
    /// Configuration with default timings for `database_url`.
    pub fn new(database_url: impl Into<String>) -> Self {
        let lease_ttl = Duration::from_millis(DEFAULT_LEASE_TTL_MS);
        Self {
            database_url: database_url.into(),
            lease_ttl,
            heartbeat_interval: lease_ttl.mul_f64(MAX_RENEWAL_RATIO),
            failure_detection_multiplier: DEFAULT_FAILURE_DETECTION_MULTIPLIER,
            recovery_lock_ttl: Duration::from_millis(DEFAULT_RECOVERY_LOCK_TTL_MS),
            shutdown_grace_period: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_PERIOD_MS),
            scan_interval: Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            janitor_interval: Duration::from_millis(DEFAULT_JANITOR_INTERVAL_MS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BATON_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `BATON_LEASE_TTL_MS` (30000)
    /// - `BATON_HEARTBEAT_INTERVAL_MS` (0.6 x lease TTL)
    /// - `BATON_FAILURE_DETECTION_MULTIPLIER` (2.0)
    /// - `BATON_RECOVERY_LOCK_TTL_MS` (10000)
    /// - `BATON_SHUTDOWN_GRACE_PERIOD_MS` (30000)
    /// - `BATON_SCAN_INTERVAL_MS` (15000)
    /// - `BATON_SCAN_BATCH_SIZE` (100)
    /// - `BATON_MAX_RECOVERY_ATTEMPTS` (3)
    /// - `BATON_JANITOR_INTERVAL_MS` (300000)
    ///
    /// The result is validated with [`Config::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("BATON_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("BATON_DATABASE_URL"))?;

        let lease_ttl = env_millis("BATON_LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS)?;
        let heartbeat_interval = match std::env::var("BATON_HEARTBEAT_INTERVAL_MS") {
            Ok(raw) => parse_millis("BATON_HEARTBEAT_INTERVAL_MS", &raw)?,
            Err(_) => lease_ttl.mul_f64(MAX_RENEWAL_RATIO),
        };

        let failure_detection_multiplier: f64 =
            std::env::var("BATON_FAILURE_DETECTION_MULTIPLIER")
                .unwrap_or_else(|_| DEFAULT_FAILURE_DETECTION_MULTIPLIER.to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("BATON_FAILURE_DETECTION_MULTIPLIER", "must be a number")
                })?;

        let scan_batch_size: u32 = std::env::var("BATON_SCAN_BATCH_SIZE")
            .unwrap_or_else(|_| DEFAULT_SCAN_BATCH_SIZE.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("BATON_SCAN_BATCH_SIZE", "must be a positive integer")
            })?;

        let max_recovery_attempts: u32 = std::env::var("BATON_MAX_RECOVERY_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_MAX_RECOVERY_ATTEMPTS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("BATON_MAX_RECOVERY_ATTEMPTS", "must be a positive integer")
            })?;

        let config = Self {
            database_url,
            lease_ttl,
            heartbeat_interval,
            failure_detection_multiplier,
            recovery_lock_ttl: env_millis(
                "BATON_RECOVERY_LOCK_TTL_MS",
                DEFAULT_RECOVERY_LOCK_TTL_MS,
            )?,
            shutdown_grace_period: env_millis(
                "BATON_SHUTDOWN_GRACE_PERIOD_MS",
                DEFAULT_SHUTDOWN_GRACE_PERIOD_MS,
            )?,
            scan_interval: env_millis("BATON_SCAN_INTERVAL_MS", DEFAULT_SCAN_INTERVAL_MS)?,
            scan_batch_size,
            max_recovery_attempts,
            janitor_interval: env_millis("BATON_JANITOR_INTERVAL_MS", DEFAULT_JANITOR_INTERVAL_MS)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the lease TTL and reset the heartbeat interval to 0.6 x TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self.heartbeat_interval = ttl.mul_f64(MAX_RENEWAL_RATIO);
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the failure-detection multiplier.
    pub fn with_failure_detection_multiplier(mut self, multiplier: f64) -> Self {
        self.failure_detection_multiplier = multiplier;
        self
    }

    /// Set the recovery lock TTL.
    pub fn with_recovery_lock_ttl(mut self, ttl: Duration) -> Self {
        self.recovery_lock_ttl = ttl;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Set the failure-detector scan interval.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the scan batch size.
    pub fn with_scan_batch_size(mut self, size: u32) -> Self {
        self.scan_batch_size = size;
        self
    }

    /// Set the recovery attempt bound.
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Set the janitor interval.
    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    /// Check the timing invariants between lease, heartbeat and detection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Invalid("BATON_LEASE_TTL_MS", "must be > 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "BATON_HEARTBEAT_INTERVAL_MS",
                "must be > 0",
            ));
        }
        if self.heartbeat_interval > self.lease_ttl.mul_f64(MAX_RENEWAL_RATIO) {
            return Err(ConfigError::Invalid(
                "BATON_HEARTBEAT_INTERVAL_MS",
                "must be at most 0.6 x BATON_LEASE_TTL_MS",
            ));
        }
        if !(self.failure_detection_multiplier >= 2.0) {
            return Err(ConfigError::Invalid(
                "BATON_FAILURE_DETECTION_MULTIPLIER",
                "must be >= 2.0",
            ));
        }
        if self.recovery_lock_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "BATON_RECOVERY_LOCK_TTL_MS",
                "must be > 0",
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(ConfigError::Invalid("BATON_SCAN_INTERVAL_MS", "must be > 0"));
        }
        if self.scan_batch_size == 0 {
            return Err(ConfigError::Invalid("BATON_SCAN_BATCH_SIZE", "must be > 0"));
        }
        if self.max_recovery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "BATON_MAX_RECOVERY_ATTEMPTS",
                "must be > 0",
            ));
        }
        if self.janitor_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "BATON_JANITOR_INTERVAL_MS",
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Fraction of a lease's TTL after which it is renewed.
    pub fn renewal_ratio(&self) -> f64 {
        (self.heartbeat_interval.as_secs_f64() / self.lease_ttl.as_secs_f64())
            .min(MAX_RENEWAL_RATIO)
    }

    /// Renewal interval for a lease of length `ttl`.
    pub fn renewal_interval(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.renewal_ratio())
    }

    /// Age of `updated_at` after which a running instance is suspect.
    pub fn failure_detection_threshold(&self) -> Duration {
        let scaled = self.lease_ttl.mul_f64(self.failure_detection_multiplier);
        scaled.max(self.lease_ttl + self.heartbeat_interval)
    }
}

fn env_millis(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_millis(name, &raw),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn parse_millis(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid(name, "must be a duration in milliseconds"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "BATON_DATABASE_URL",
        "BATON_LEASE_TTL_MS",
        "BATON_HEARTBEAT_INTERVAL_MS",
        "BATON_FAILURE_DETECTION_MULTIPLIER",
        "BATON_RECOVERY_LOCK_TTL_MS",
        "BATON_SHUTDOWN_GRACE_PERIOD_MS",
        "BATON_SCAN_INTERVAL_MS",
        "BATON_SCAN_BATCH_SIZE",
        "BATON_MAX_RECOVERY_ATTEMPTS",
        "BATON_JANITOR_INTERVAL_MS",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("BATON_DATABASE_URL", "postgres://localhost/test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(18));
        assert_eq!(config.failure_detection_multiplier, 2.0);
        assert_eq!(config.recovery_lock_ttl, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(30));
        assert_eq!(config.scan_interval, Duration::from_secs(15));
        assert_eq!(config.scan_batch_size, 100);
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.janitor_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_heartbeat_defaults_follow_custom_ttl() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("BATON_DATABASE_URL", "sqlite::memory:");
        guard.set("BATON_LEASE_TTL_MS", "10000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(6));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BATON_DATABASE_URL")));
        assert!(err.to_string().contains("BATON_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("BATON_DATABASE_URL", "postgres://localhost/test");
        guard.set("BATON_SCAN_INTERVAL_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("BATON_SCAN_INTERVAL_MS", _)));
    }

    #[test]
    fn test_heartbeat_too_late_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("BATON_DATABASE_URL", "postgres://localhost/test");
        guard.set("BATON_LEASE_TTL_MS", "10000");
        guard.set("BATON_HEARTBEAT_INTERVAL_MS", "7000");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("BATON_HEARTBEAT_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_validate_rejects_small_multiplier() {
        let config = Config::new("sqlite::memory:").with_failure_detection_multiplier(1.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("BATON_FAILURE_DETECTION_MULTIPLIER", _))
        ));

        let config = Config::new("sqlite::memory:").with_failure_detection_multiplier(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renewal_interval_uses_ratio() {
        let config = Config::new("sqlite::memory:");
        assert!((config.renewal_ratio() - 0.6).abs() < 1e-9);
        assert_eq!(
            config.renewal_interval(Duration::from_secs(10)),
            Duration::from_secs(6)
        );

        let config = Config::new("sqlite::memory:")
            .with_lease_ttl(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_secs(2));
        assert_eq!(
            config.renewal_interval(Duration::from_secs(5)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_failure_detection_threshold() {
        let config = Config::new("sqlite::memory:");
        // 2 x 30s beats 30s + 18s
        assert_eq!(config.failure_detection_threshold(), Duration::from_secs(60));
        assert!(config.failure_detection_threshold() > config.lease_ttl + config.heartbeat_interval);

        let config = Config::new("sqlite::memory:").with_failure_detection_multiplier(3.0);
        assert_eq!(config.failure_detection_threshold(), Duration::from_secs(90));
    }
}
