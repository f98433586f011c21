//! Scheduler Module
//!
//! The timer facility jobs register against. The job runtime only needs the
//! [`Scheduler`] contract; [`TokioScheduler`] is the implementation used by
//! the binary and the tests.

mod local;
mod schedule;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use local::TokioScheduler;
pub use schedule::CronSchedule;

/// Future produced by one run of a scheduled task.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A schedulable unit: called once per tick, yields the run.
pub type Task = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Registration options shared by interval and cron tasks.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Registration key; registering the same id again replaces the task
    pub id: String,
    /// Never start a run while the previous run of this id is still going
    pub prevent_overrun: bool,
}

impl TaskOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prevent_overrun: true,
        }
    }
}

pub trait Scheduler: Send + Sync {
    /// Runs `task` every `every`, first immediately if `run_immediately`.
    fn add_interval_task(
        &self,
        every: Duration,
        run_immediately: bool,
        task: Task,
        options: TaskOptions,
    );

    /// Runs `task` at each firing of `schedule`.
    fn add_cron_task(&self, schedule: CronSchedule, task: Task, options: TaskOptions);

    /// Stops the task registered under `id`. Returns false if none was.
    fn stop_by_id(&self, id: &str) -> bool;

    /// Stops every task.
    fn stop(&self);
}
