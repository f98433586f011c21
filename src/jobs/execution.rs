//! Shared execution plumbing: collaborators, outcomes, failure isolation.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, warn, Instrument};

use crate::jobs::ExecutionContext;
use crate::lock::LockProvider;
use crate::observability::{ErrorReport, ErrorReporter, LogErrorReporter, Tracer, TracingTracer};
use crate::scheduler::Scheduler;

// == Job Dependencies ==
/// Collaborators every job runtime needs from its host.
#[derive(Clone)]
pub struct JobDependencies {
    pub locks: LockProvider,
    pub scheduler: Arc<dyn Scheduler>,
    pub tracer: Arc<dyn Tracer>,
    pub error_reporter: Arc<dyn ErrorReporter>,
}

impl JobDependencies {
    /// Uses [`TracingTracer`] and [`LogErrorReporter`] until replaced.
    pub fn new(locks: LockProvider, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            locks,
            scheduler,
            tracer: Arc::new(TracingTracer::new()),
            error_reporter: Arc::new(LogErrorReporter),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_error_reporter(mut self, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = error_reporter;
        self
    }
}

// == Execution Outcome ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The work ran and returned Ok
    Completed,
    /// Another executor holds the lock; the work was not started
    Skipped,
    /// The work, or the lock handling around it, failed
    Failed(String),
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Runs `work` on its own task and folds errors and panics into an outcome.
///
/// Errors are logged and reported once. Panics are logged only: they carry
/// no error value to report.
pub(crate) async fn run_isolated<F>(
    work: F,
    deps: &JobDependencies,
    ctx: &ExecutionContext,
) -> ExecutionOutcome
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(work.in_current_span()).await {
        Ok(Ok(())) => ExecutionOutcome::Completed,
        Ok(Err(error)) => {
            report_failure(deps, ctx, &error);
            ExecutionOutcome::Failed(format!("{error:#}"))
        }
        Err(join_error) if join_error.is_panic() => {
            error!(
                job_id = %ctx.job_id(),
                execution_uuid = %ctx.execution_uuid(),
                "Job execution panicked"
            );
            ExecutionOutcome::Failed("job execution panicked".to_string())
        }
        Err(_) => {
            warn!(
                job_id = %ctx.job_id(),
                execution_uuid = %ctx.execution_uuid(),
                "Job execution cancelled"
            );
            ExecutionOutcome::Failed("job execution cancelled".to_string())
        }
    }
}

/// Logs `error` with the correlation id and hands it to the error reporter.
pub(crate) fn report_failure(
    deps: &JobDependencies,
    ctx: &ExecutionContext,
    error: &anyhow::Error,
) {
    error!(
        job_id = %ctx.job_id(),
        execution_uuid = %ctx.execution_uuid(),
        error = ?error,
        "Job execution failed"
    );
    deps.error_reporter.report(
        ErrorReport::new(error)
            .with_context("job_id", ctx.job_id())
            .with_context("execution_uuid", ctx.execution_uuid()),
    );
}
