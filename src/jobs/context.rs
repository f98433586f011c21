//! Per-execution context and the exclusive lock helper jobs build on.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::LockError;
use crate::lock::{LockHandle, LockOptions, LockProvider};

/// Lock name used for the job-level leader lock.
pub const EXCLUSIVE_LOCK_NAME: &str = "exclusive";

/// Store resource for `lock_name` under `job_id`: `{job_id}:locks:{lock_name}`.
pub fn lock_resource(job_id: &str, lock_name: &str) -> String {
    format!("{job_id}:locks:{lock_name}")
}

// == Exclusive Lock Request ==
#[derive(Debug, Clone, Default)]
pub struct ExclusiveLockRequest {
    /// Defaults to [`EXCLUSIVE_LOCK_NAME`]
    pub lock_name: Option<String>,
    /// Defaults to the job's lock timeout
    pub lock_timeout: Option<Duration>,
    /// Defaults to 80% of the lock timeout
    pub refresh_interval: Option<Duration>,
    /// Owner identifier; enables renewal by the same owner
    pub identifier: Option<String>,
}

impl ExclusiveLockRequest {
    pub fn named(lock_name: impl Into<String>) -> Self {
        Self {
            lock_name: Some(lock_name.into()),
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

// == Try Acquire Exclusive Lock ==
/// Single-attempt acquisition with same-owner renewal.
///
/// 1. One set-if-absent attempt with the requested lease and auto-refresh.
/// 2. If that fails and an identifier was given, one more attempt that only
///    extends the lease when the identifier already owns it.
/// 3. Otherwise no lock.
///
/// Step 2 can race the store's own expiry by up to one refresh interval;
/// that window is accepted.
pub async fn try_acquire_exclusive_lock(
    locks: &LockProvider,
    job_id: &str,
    request: ExclusiveLockRequest,
    default_lock_timeout: Duration,
) -> Result<Option<LockHandle>, LockError> {
    let lock_name = request.lock_name.as_deref().unwrap_or(EXCLUSIVE_LOCK_NAME);
    let resource = lock_resource(job_id, lock_name);

    let mut options = LockOptions::default()
        .with_acquire_attempts_limit(1)
        .with_lock_timeout(request.lock_timeout.unwrap_or(default_lock_timeout));
    if let Some(interval) = request.refresh_interval {
        options = options.with_refresh_interval(interval);
    }
    if let Some(identifier) = &request.identifier {
        options = options.with_identifier(identifier.clone());
    }

    if let Some(lock) = locks.try_acquire(&resource, options.clone()).await? {
        return Ok(Some(lock));
    }

    match request.identifier {
        Some(_) => locks.try_acquire(&resource, options.acquired_externally()).await,
        None => Ok(None),
    }
}

// == Execution Context ==
/// Everything one run of a job knows about itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_uuid: String,
    job_id: String,
    started_at: DateTime<Utc>,
    locks: LockProvider,
    default_lock_timeout: Duration,
}

impl ExecutionContext {
    pub fn new(
        job_id: impl Into<String>,
        execution_uuid: impl Into<String>,
        locks: LockProvider,
        default_lock_timeout: Duration,
    ) -> Self {
        Self {
            execution_uuid: execution_uuid.into(),
            job_id: job_id.into(),
            started_at: Utc::now(),
            locks,
            default_lock_timeout,
        }
    }

    pub fn execution_uuid(&self) -> &str {
        &self.execution_uuid
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Takes a lock scoped to this job; see [`try_acquire_exclusive_lock`].
    pub async fn try_acquire_exclusive_lock(
        &self,
        request: ExclusiveLockRequest,
    ) -> Result<Option<LockHandle>, LockError> {
        try_acquire_exclusive_lock(&self.locks, &self.job_id, request, self.default_lock_timeout)
            .await
    }
}
