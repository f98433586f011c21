//! Leased Jobs - cluster-safe periodic and background jobs
//!
//! Runs idempotent async work on a schedule or from a queue, with at most
//! one executor per tick across processes. Exclusion comes from
//! self-refreshing leases in a shared store (Redis, or in memory).

pub mod config;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod observability;
pub mod samples;
pub mod scheduler;
pub mod tasks;

pub use config::Config;
pub use error::{JobError, LockError, Result};
pub use jobs::{
    BackgroundJob, BackgroundJobOptions, BackgroundJobProcessor, ExclusiveLockRequest,
    ExecutionContext, ExecutionOutcome, JobDependencies, JobOptions, JobSchedule, PeriodicJob,
    PeriodicJobRunner, SingleConsumerMode,
};
pub use lock::{LockHandle, LockOptions, LockProvider, LockStore, MemoryLockStore};
pub use scheduler::{Scheduler, TokioScheduler};
pub use tasks::spawn_cleanup_task;
