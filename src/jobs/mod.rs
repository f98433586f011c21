//! Jobs Module
//!
//! Periodic and background job runtimes built on the distributed lock.
//!
//! A job is a plain type implementing [`PeriodicJob`] or [`BackgroundJob`].
//! The runner types wrap it with the lifecycle: scheduling or queueing,
//! per-execution context, the exclusive lock, failure isolation and
//! reporting.

mod background;
mod context;
mod execution;
mod options;
mod periodic;

// Re-export public types
pub use background::{BackgroundJob, BackgroundJobOptions, BackgroundJobProcessor};
pub use context::{
    lock_resource, try_acquire_exclusive_lock, ExclusiveLockRequest, ExecutionContext,
    EXCLUSIVE_LOCK_NAME,
};
pub use execution::{ExecutionOutcome, JobDependencies};
pub use options::{JobOptions, JobSchedule, SingleConsumerMode};
pub use periodic::{PeriodicJob, PeriodicJobRunner};
