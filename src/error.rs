//! Error types for the job runtime
//!
//! Provides unified error handling using thiserror. Lock contention is not an
//! error anywhere in this crate: a failed acquisition is `Ok(None)`.

use thiserror::Error;

// == Lock Error Enum ==
/// Failures of the distributed lock store.
#[derive(Error, Debug)]
pub enum LockError {
    /// The backing store could not be reached or answered unexpectedly
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// Lock options rejected before touching the store
    #[error("Invalid lock options: {0}")]
    InvalidOptions(String),

    /// Error returned by the Redis client
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

// == Job Error Enum ==
/// Unified error type for job construction and wiring.
#[derive(Error, Debug)]
pub enum JobError {
    /// Job descriptor failed validation
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// Cron expression could not be parsed
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Lock store failure surfaced outside of a job execution
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Background queue no longer accepts work
    #[error("Queue closed: {0}")]
    QueueClosed(String),
}

// == Result Type Alias ==
/// Convenience Result type for the job runtime.
pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_converts_into_job_error() {
        let err: JobError = LockError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, JobError::Lock(LockError::Unavailable(_))));
        assert_eq!(err.to_string(), "Lock store unavailable: connection refused");
    }

    #[test]
    fn test_invalid_cron_message() {
        let err = JobError::InvalidCron {
            expression: "* *".to_string(),
            reason: "too few fields".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid cron expression '* *': too few fields"
        );
    }
}
