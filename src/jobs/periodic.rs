//! Periodic Job Module
//!
//! Turns an idempotent unit of work into a cluster-safe recurring task.
//!
//! A job implements [`PeriodicJob`]; [`PeriodicJobRunner`] supplies the
//! lifecycle around it:
//!
//! ```text
//! START ─┬─ single consumer off ─────────────────────────► RUN ──► END
//!        └─ TRY_ACQUIRE ─┬─ acquired ──► RUN ──► DEGRADE_LOCK ──► END
//!                        └─ not acquired ──► SKIP ──────────────► END
//! ```
//!
//! After a run the leader lock is not released. It is rewritten to the
//! cool-down lease and left to expire, so the next tick on any node cannot
//! immediately repeat the work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::execution::{report_failure, run_isolated};
use crate::jobs::{
    ExclusiveLockRequest, ExecutionContext, ExecutionOutcome, JobDependencies, JobOptions,
    JobSchedule,
};
use crate::lock::{LeaseToken, LockHandle};
use crate::observability::log_execution;
use crate::scheduler::{Task, TaskFuture, TaskOptions};

// == Periodic Job ==
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn options(&self) -> &JobOptions;

    /// One pass of the work. Must be safe to repeat.
    async fn process_internal(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

// == Periodic Job Runner ==
pub struct PeriodicJobRunner<J: PeriodicJob> {
    job: Arc<J>,
    options: JobOptions,
    deps: JobDependencies,
    /// Lease timeouts, resolved once at construction
    lock_timeout: Duration,
    lock_timeout_after_success: Duration,
    /// Leader leases of in-flight executions, released on dispose
    leases: Mutex<HashMap<String, LeaseToken>>,
}

impl<J: PeriodicJob> PeriodicJobRunner<J> {
    /// Validates the job's descriptor and wraps it.
    pub fn new(job: J, deps: JobDependencies) -> Result<Arc<Self>> {
        let options = job.options().clone();
        options.validate()?;
        let lock_timeout = options.lock_timeout();
        let lock_timeout_after_success = options.lock_timeout_after_success();

        Ok(Arc::new(Self {
            job: Arc::new(job),
            options,
            deps,
            lock_timeout,
            lock_timeout_after_success,
            leases: Mutex::new(HashMap::new()),
        }))
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Running lease of the leader lock.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Cool-down lease written after a run.
    pub fn lock_timeout_after_success(&self) -> Duration {
        self.lock_timeout_after_success
    }

    // == Register ==
    /// Binds the job to the scheduler under its id, with overrun prevention.
    ///
    /// Registering again replaces the earlier registration. The scheduler
    /// only holds a weak reference; a dropped runner stops doing work.
    pub fn register(self: &Arc<Self>) {
        let runner = Arc::downgrade(self);
        let task: Task = Arc::new(move || -> TaskFuture {
            let runner = runner.clone();
            Box::pin(async move {
                if let Some(runner) = runner.upgrade() {
                    let execution_uuid = Uuid::new_v4().to_string();
                    runner.process(&execution_uuid).await;
                }
            })
        });

        let task_options = TaskOptions::new(self.options.job_id.clone());
        match &self.options.schedule {
            JobSchedule::Interval {
                every,
                run_immediately,
            } => self
                .deps
                .scheduler
                .add_interval_task(*every, *run_immediately, task, task_options),
            JobSchedule::Cron(schedule) => {
                self.deps
                    .scheduler
                    .add_cron_task(schedule.clone(), task, task_options)
            }
        }

        info!(job_id = %self.options.job_id, "Periodic job registered");
    }

    // == Process ==
    /// Runs one execution identified by `execution_uuid`.
    ///
    /// Never fails: the returned outcome is informational.
    pub async fn process(&self, execution_uuid: &str) -> ExecutionOutcome {
        let span = info_span!(
            "periodic_job",
            job_id = %self.options.job_id,
            executor_id = %execution_uuid
        );
        self.process_in_span(execution_uuid).instrument(span).await
    }

    async fn process_in_span(&self, execution_uuid: &str) -> ExecutionOutcome {
        let started = Instant::now();
        let ctx = ExecutionContext::new(
            self.options.job_id.clone(),
            execution_uuid,
            self.deps.locks.clone(),
            self.lock_timeout,
        );

        self.deps.tracer.start(&self.options.job_id, execution_uuid);
        let outcome = if self.options.single_consumer_mode.enabled {
            self.process_exclusively(&ctx).await
        } else {
            self.run(&ctx).await
        };
        self.deps.tracer.stop(execution_uuid);

        log_execution(
            self.options.should_log_execution,
            &self.options.job_id,
            outcome.as_str(),
            started.elapsed().as_millis() as u64,
        );
        outcome
    }

    async fn process_exclusively(&self, ctx: &ExecutionContext) -> ExecutionOutcome {
        let request = ExclusiveLockRequest::default()
            .with_identifier(ctx.execution_uuid())
            .with_lock_timeout(self.lock_timeout);

        let lock = match ctx.try_acquire_exclusive_lock(request).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("Exclusive lock held by another executor, skipping run");
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                let error = anyhow::Error::new(e).context("acquiring exclusive lock");
                report_failure(&self.deps, ctx, &error);
                return ExecutionOutcome::Failed(format!("{error:#}"));
            }
        };

        self.track_lease(ctx.execution_uuid(), lock.lease_token());
        let outcome = self.run(ctx).await;
        let degraded = self.degrade_lock(lock).await;
        self.untrack_lease(ctx.execution_uuid());

        match degraded {
            Ok(()) => outcome,
            Err(error) => {
                report_failure(&self.deps, ctx, &error);
                match outcome {
                    ExecutionOutcome::Completed => ExecutionOutcome::Failed(format!("{error:#}")),
                    other => other,
                }
            }
        }
    }

    async fn run(&self, ctx: &ExecutionContext) -> ExecutionOutcome {
        let job = self.job.clone();
        let work_ctx = ctx.clone();
        run_isolated(
            async move { job.process_internal(&work_ctx).await },
            &self.deps,
            ctx,
        )
        .await
    }

    /// Swaps the running lease for the cool-down lease. Does not release.
    async fn degrade_lock(&self, mut lock: LockHandle) -> anyhow::Result<()> {
        lock.finish_refresh().await;
        let cool_down = self.lock_timeout_after_success;

        match lock.update_timeout(cool_down).await {
            Ok(true) => {
                debug!(
                    cool_down_ms = cool_down.as_millis() as u64,
                    "Exclusive lock degraded to cool-down lease"
                );
                Ok(())
            }
            Ok(false) => {
                warn!("Exclusive lock was lost before the cool-down lease could be written");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("degrading exclusive lock")),
        }
    }

    // == Dispose ==
    /// Stops scheduling and releases the leases of in-flight executions.
    ///
    /// In-flight work is not cancelled. Safe to call repeatedly and before
    /// [`register`](Self::register).
    pub async fn dispose(&self) {
        self.deps.scheduler.stop_by_id(&self.options.job_id);

        let leases: Vec<(String, LeaseToken)> = self.lock_leases().drain().collect();
        for (execution_uuid, lease) in leases {
            match lease.release().await {
                Ok(released) => debug!(
                    job_id = %self.options.job_id,
                    execution_uuid = %execution_uuid,
                    released,
                    "Lease released on dispose"
                ),
                Err(e) => warn!(
                    job_id = %self.options.job_id,
                    execution_uuid = %execution_uuid,
                    error = %e,
                    "Failed to release lease on dispose"
                ),
            }
        }

        debug!(job_id = %self.options.job_id, "Periodic job disposed");
    }

    /// Number of executions currently holding the leader lock in this process.
    pub fn active_leases(&self) -> usize {
        self.lock_leases().len()
    }

    fn track_lease(&self, execution_uuid: &str, lease: LeaseToken) {
        self.lock_leases().insert(execution_uuid.to_string(), lease);
    }

    fn untrack_lease(&self, execution_uuid: &str) {
        self.lock_leases().remove(execution_uuid);
    }

    fn lock_leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, LeaseToken>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SingleConsumerMode;
    use crate::lock::{LockProvider, LockStore, MemoryLockStore};
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        options: JobOptions,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn options(&self) -> &JobOptions {
            &self.options
        }

        async fn process_internal(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn deps(store: &MemoryLockStore) -> JobDependencies {
        JobDependencies::new(
            LockProvider::new(Arc::new(store.clone())),
            Arc::new(TokioScheduler::new()),
        )
    }

    fn counting_job(mode: SingleConsumerMode) -> CountingJob {
        CountingJob {
            options: JobOptions::new("counting", JobSchedule::every(Duration::from_secs(1)))
                .with_single_consumer_mode(mode),
            runs: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        let store = MemoryLockStore::new();
        let job = CountingJob {
            options: JobOptions::new("", JobSchedule::every(Duration::from_secs(1))),
            runs: AtomicUsize::new(0),
        };
        assert!(PeriodicJobRunner::new(job, deps(&store)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_lock_left_with_cool_down_lease() {
        let store = MemoryLockStore::new();
        let runner = PeriodicJobRunner::new(
            counting_job(SingleConsumerMode::enabled()),
            deps(&store),
        )
        .unwrap();

        let outcome = runner.process("exec-1").await;

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(runner.job().runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.owner_of("counting:locks:exclusive").await.as_deref(),
            Some("exec-1")
        );
        assert_eq!(
            store.ttl_remaining("counting:locks:exclusive").await,
            Some(Duration::from_secs(1))
        );
        assert_eq!(runner.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_lock_timeouts_fixed_at_construction() {
        let store = MemoryLockStore::new();
        let job = CountingJob {
            options: JobOptions::new("reports", JobSchedule::cron("0 0 9,17 * * *").unwrap())
                .with_single_consumer_mode(SingleConsumerMode::enabled()),
            runs: AtomicUsize::new(0),
        };
        let runner = PeriodicJobRunner::new(job, deps(&store)).unwrap();

        let lock_timeout = runner.lock_timeout();
        let cool_down = runner.lock_timeout_after_success();
        assert_eq!(lock_timeout, cool_down * 2);

        assert!(runner.process("exec-1").await.is_completed());
        assert_eq!(store.ttl_remaining("reports:locks:exclusive").await, Some(cool_down));

        store.release("reports:locks:exclusive", "exec-1").await.unwrap();
        assert!(runner.process("exec-2").await.is_completed());
        assert_eq!(store.ttl_remaining("reports:locks:exclusive").await, Some(cool_down));
        assert_eq!(runner.lock_timeout(), lock_timeout);
        assert_eq!(runner.lock_timeout_after_success(), cool_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_lock_timeouts() {
        let store = MemoryLockStore::new();
        let runner = PeriodicJobRunner::new(
            counting_job(SingleConsumerMode::enabled()),
            deps(&store),
        )
        .unwrap();

        assert_eq!(runner.lock_timeout(), Duration::from_secs(2));
        assert_eq!(runner.lock_timeout_after_success(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_job_runs_on_schedule() {
        let store = MemoryLockStore::new();
        let runner = PeriodicJobRunner::new(
            counting_job(SingleConsumerMode::disabled()),
            deps(&store),
        )
        .unwrap();

        runner.register();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        runner.dispose().await;

        assert_eq!(runner.job().runs.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runner.job().runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_single_consumer_job_respects_cool_down() {
        let store = MemoryLockStore::new();
        let runner = PeriodicJobRunner::new(
            counting_job(SingleConsumerMode::enabled()),
            deps(&store),
        )
        .unwrap();

        runner.register();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        runner.dispose().await;

        // Ticks at 1s..4s; each cool-down lease (1s) lapses exactly on the next tick.
        let runs = runner.job().runs.load(Ordering::SeqCst);
        assert!((2..=4).contains(&runs), "unexpected run count {runs}");
    }
}
