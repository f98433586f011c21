//! Configuration Module
//!
//! Handles loading the job host configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Job host configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Redis connection URL; the in-memory lock store is used when unset
    pub redis_url: Option<String>,
    /// Prefix prepended to every lock key
    pub lock_key_prefix: String,
    /// Lapsed-lease sweep interval for the in-memory store, in seconds
    pub lock_cleanup_interval: u64,
    /// Interval of the stale user cleanup job, in milliseconds
    pub stale_users_interval_ms: u64,
    /// How long a user may stay inactive before being deleted, in seconds
    pub stale_users_retention_secs: u64,
    /// Cron expression of the log file job
    pub log_files_cron: String,
    /// Workers of the email queue
    pub email_workers: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `REDIS_URL` - Redis URL (default: unset, in-memory locks)
    /// - `LOCK_KEY_PREFIX` - Lock key prefix (default: "leased_jobs:")
    /// - `LOCK_CLEANUP_INTERVAL` - Sweep frequency in seconds, zero rejected (default: 30)
    /// - `STALE_USERS_INTERVAL_MS` - User cleanup period (default: 60000)
    /// - `STALE_USERS_RETENTION_SECS` - Inactivity window (default: 2592000, 30 days)
    /// - `LOG_FILES_CRON` - Log file schedule (default: "*/5 * * * *")
    /// - `EMAIL_WORKERS` - Email queue workers (default: 2)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            lock_key_prefix: env::var("LOCK_KEY_PREFIX").unwrap_or(defaults.lock_key_prefix),
            lock_cleanup_interval: parse_non_zero_or(
                "LOCK_CLEANUP_INTERVAL",
                defaults.lock_cleanup_interval,
            ),
            stale_users_interval_ms: parse_or(
                "STALE_USERS_INTERVAL_MS",
                defaults.stale_users_interval_ms,
            ),
            stale_users_retention_secs: parse_or(
                "STALE_USERS_RETENTION_SECS",
                defaults.stale_users_retention_secs,
            ),
            log_files_cron: env::var("LOG_FILES_CRON").unwrap_or(defaults.log_files_cron),
            email_workers: parse_or("EMAIL_WORKERS", defaults.email_workers),
        }
    }

    pub fn lock_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.lock_cleanup_interval)
    }

    pub fn stale_users_interval(&self) -> Duration {
        Duration::from_millis(self.stale_users_interval_ms)
    }

    pub fn stale_users_retention(&self) -> Duration {
        Duration::from_secs(self.stale_users_retention_secs)
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`parse_or`], but a zero value falls back to `default`.
fn parse_non_zero_or(key: &str, default: u64) -> u64 {
    match parse_or(key, default) {
        0 => {
            warn!("{} must be greater than zero, using {}", key, default);
            default
        }
        value => value,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            lock_key_prefix: "leased_jobs:".to_string(),
            lock_cleanup_interval: 30,
            stale_users_interval_ms: 60_000,
            stale_users_retention_secs: 30 * 24 * 3600,
            log_files_cron: "*/5 * * * *".to_string(),
            email_workers: 2,
        }
    }
}
