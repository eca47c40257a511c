// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading from environment variables.

/// Tributary engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Tick scheduler interval in seconds
    pub tick_interval_secs: u64,
    /// Maximum stream retries before the stream is terminally failed
    pub max_retries: i32,
    /// Hours of updated_at staleness before the auditor treats a
    /// run/stream as stuck
    pub stuck_threshold_hours: i64,
    /// Days a processed run/webhook is retained before purging
    pub retention_days: i64,
    /// Page size for integration scans and delayed-run promotion
    pub page_size: i64,
    /// Page size for the auditor's pending-webhook sweep
    pub webhook_page_size: i64,
    /// Fan-out size above which check enqueues are spread over time
    pub jitter_threshold: i64,
    /// Seconds between jitter delay buckets
    pub jitter_bucket_secs: u64,
    /// Seconds added on top of a rate-limit reset hint before retrying
    pub rate_limit_buffer_secs: u64,
    /// Base seconds for stream retry backoff (doubles per attempt)
    pub stream_retry_backoff_secs: u64,
    /// Stuck-state auditor sweep interval in seconds
    pub audit_interval_secs: u64,
    /// Retention sweep interval in seconds
    pub retention_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TRIBUTARY_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TRIBUTARY_TICK_INTERVAL_SECS`: scheduler tick (default: 60)
    /// - `TRIBUTARY_MAX_RETRIES`: stream retry budget (default: 5)
    /// - `TRIBUTARY_STUCK_THRESHOLD_HOURS`: auditor staleness threshold (default: 1)
    /// - `TRIBUTARY_RETENTION_DAYS`: processed-row retention (default: 90)
    /// - `TRIBUTARY_PAGE_SIZE`: scan page size (default: 100)
    /// - `TRIBUTARY_WEBHOOK_PAGE_SIZE`: stuck-webhook page size (default: 20)
    /// - `TRIBUTARY_JITTER_THRESHOLD`: fan-out jitter threshold (default: 50)
    /// - `TRIBUTARY_JITTER_BUCKET_SECS`: jitter bucket spacing (default: 10)
    /// - `TRIBUTARY_RATE_LIMIT_BUFFER_SECS`: reset-hint buffer (default: 5)
    /// - `TRIBUTARY_STREAM_RETRY_BACKOFF_SECS`: retry backoff base (default: 5)
    /// - `TRIBUTARY_AUDIT_INTERVAL_SECS`: auditor cadence (default: 300)
    /// - `TRIBUTARY_RETENTION_INTERVAL_SECS`: retention cadence (default: 3600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TRIBUTARY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TRIBUTARY_DATABASE_URL"))?;

        Ok(Self {
            database_url,
            tick_interval_secs: parse_var("TRIBUTARY_TICK_INTERVAL_SECS", 60)?,
            max_retries: parse_var("TRIBUTARY_MAX_RETRIES", 5)?,
            stuck_threshold_hours: parse_var("TRIBUTARY_STUCK_THRESHOLD_HOURS", 1)?,
            retention_days: parse_var("TRIBUTARY_RETENTION_DAYS", 90)?,
            page_size: parse_var("TRIBUTARY_PAGE_SIZE", 100)?,
            webhook_page_size: parse_var("TRIBUTARY_WEBHOOK_PAGE_SIZE", 20)?,
            jitter_threshold: parse_var("TRIBUTARY_JITTER_THRESHOLD", 50)?,
            jitter_bucket_secs: parse_var("TRIBUTARY_JITTER_BUCKET_SECS", 10)?,
            rate_limit_buffer_secs: parse_var("TRIBUTARY_RATE_LIMIT_BUFFER_SECS", 5)?,
            stream_retry_backoff_secs: parse_var("TRIBUTARY_STREAM_RETRY_BACKOFF_SECS", 5)?,
            audit_interval_secs: parse_var("TRIBUTARY_AUDIT_INTERVAL_SECS", 300)?,
            retention_interval_secs: parse_var("TRIBUTARY_RETENTION_INTERVAL_SECS", 3600)?,
        })
    }
}

impl Default for Config {
    /// Defaults mirroring `from_env` with an in-memory database. Mainly
    /// useful for embedding and tests.
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            tick_interval_secs: 60,
            max_retries: 5,
            stuck_threshold_hours: 1,
            retention_days: 90,
            page_size: 100,
            webhook_page_size: 20,
            jitter_threshold: 50,
            jitter_bucket_secs: 10,
            rate_limit_buffer_secs: 5,
            stream_retry_backoff_secs: 5,
            audit_interval_secs: 300,
            retention_interval_secs: 3600,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a valid number")),
        Err(_) => Ok(default),
    }
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

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
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

    const OPTIONAL_VARS: &[&str] = &[
        "TRIBUTARY_TICK_INTERVAL_SECS",
        "TRIBUTARY_MAX_RETRIES",
        "TRIBUTARY_STUCK_THRESHOLD_HOURS",
        "TRIBUTARY_RETENTION_DAYS",
        "TRIBUTARY_PAGE_SIZE",
        "TRIBUTARY_WEBHOOK_PAGE_SIZE",
        "TRIBUTARY_JITTER_THRESHOLD",
        "TRIBUTARY_JITTER_BUCKET_SECS",
        "TRIBUTARY_RATE_LIMIT_BUFFER_SECS",
        "TRIBUTARY_STREAM_RETRY_BACKOFF_SECS",
        "TRIBUTARY_AUDIT_INTERVAL_SECS",
        "TRIBUTARY_RETENTION_INTERVAL_SECS",
    ];

    fn clear_optional(guard: &mut EnvGuard) {
        for var in OPTIONAL_VARS {
            guard.remove(var);
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRIBUTARY_DATABASE_URL", "postgres://localhost/test");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stuck_threshold_hours, 1);
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.webhook_page_size, 20);
        assert_eq!(config.jitter_threshold, 50);
        assert_eq!(config.rate_limit_buffer_secs, 5);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRIBUTARY_DATABASE_URL", "sqlite:test.db");
        clear_optional(&mut guard);
        guard.set("TRIBUTARY_TICK_INTERVAL_SECS", "15");
        guard.set("TRIBUTARY_MAX_RETRIES", "3");
        guard.set("TRIBUTARY_RETENTION_DAYS", "30");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:test.db");
        assert_eq!(config.tick_interval_secs, 15);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retention_days, 30);
        // untouched vars keep their defaults
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("TRIBUTARY_DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing("TRIBUTARY_DATABASE_URL")
        ));
        assert!(err.to_string().contains("TRIBUTARY_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_tick_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRIBUTARY_DATABASE_URL", "postgres://localhost/test");
        clear_optional(&mut guard);
        guard.set("TRIBUTARY_TICK_INTERVAL_SECS", "not_a_number");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TRIBUTARY_TICK_INTERVAL_SECS", _)
        ));
    }

    #[test]
    fn test_config_negative_max_retries_is_parsed() {
        // max_retries is signed because stream retries are; a negative
        // budget means every error is immediately exhausted
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRIBUTARY_DATABASE_URL", "postgres://localhost/test");
        clear_optional(&mut guard);
        guard.set("TRIBUTARY_MAX_RETRIES", "-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_retries, -1);
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_config_default_matches_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TRIBUTARY_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);

        let from_env = Config::from_env().unwrap();
        let default = Config::default();

        assert_eq!(from_env.database_url, default.database_url);
        assert_eq!(from_env.tick_interval_secs, default.tick_interval_secs);
        assert_eq!(from_env.max_retries, default.max_retries);
        assert_eq!(from_env.page_size, default.page_size);
        assert_eq!(from_env.audit_interval_secs, default.audit_interval_secs);
    }
}
