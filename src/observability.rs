//! Observability Module
//!
//! Transaction tracing and error reporting hooks used around every job
//! execution. Both default implementations write through `tracing`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{debug, error, info};

// == Tracer ==
/// Opens and closes a transaction per execution, keyed by correlation id.
pub trait Tracer: Send + Sync {
    fn start(&self, span_name: &str, correlation_id: &str);
    fn stop(&self, correlation_id: &str);
}

/// Tracer that logs transaction start and duration.
#[derive(Debug, Default)]
pub struct TracingTracer {
    open: Mutex<HashMap<String, (String, Instant)>>,
}

impl TracingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions started but not yet stopped.
    pub fn open_transactions(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }
}

impl Tracer for TracingTracer {
    fn start(&self, span_name: &str, correlation_id: &str) {
        if let Ok(mut open) = self.open.lock() {
            open.insert(
                correlation_id.to_string(),
                (span_name.to_string(), Instant::now()),
            );
        }
        debug!(transaction = %span_name, correlation_id = %correlation_id, "Transaction started");
    }

    fn stop(&self, correlation_id: &str) {
        let started = self
            .open
            .lock()
            .ok()
            .and_then(|mut open| open.remove(correlation_id));

        match started {
            Some((span_name, at)) => debug!(
                transaction = %span_name,
                correlation_id = %correlation_id,
                duration_ms = at.elapsed().as_millis() as u64,
                "Transaction finished"
            ),
            None => debug!(correlation_id = %correlation_id, "Stop for unknown transaction"),
        }
    }
}

// == Error Reporter ==
/// One failure handed to the error reporter.
#[derive(Debug)]
pub struct ErrorReport<'a> {
    pub error: &'a anyhow::Error,
    /// Extra fields such as `job_id` and `execution_uuid`
    pub context: HashMap<&'static str, String>,
}

impl<'a> ErrorReport<'a> {
    pub fn new(error: &'a anyhow::Error) -> Self {
        Self {
            error,
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.insert(key, value.into());
        self
    }
}

/// Sink for errors that were handled locally but must not go unnoticed.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport<'_>);
}

/// Reporter that emits an error-level log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, report: ErrorReport<'_>) {
        let mut context: Vec<_> = report.context.iter().collect();
        context.sort();
        error!(error = ?report.error, context = ?context, "Error reported");
    }
}

/// Log line at the end of an execution, at info or debug level.
pub(crate) fn log_execution(should_log: bool, job_id: &str, outcome: &str, duration_ms: u64) {
    if should_log {
        info!(job_id = %job_id, outcome = %outcome, duration_ms, "Job execution finished");
    } else {
        debug!(job_id = %job_id, outcome = %outcome, duration_ms, "Job execution finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_tracks_open_transactions() {
        let tracer = TracingTracer::new();
        tracer.start("cleanup", "exec-1");
        tracer.start("cleanup", "exec-2");
        assert_eq!(tracer.open_transactions(), 2);

        tracer.stop("exec-1");
        tracer.stop("unknown");
        assert_eq!(tracer.open_transactions(), 1);
    }

    #[test]
    fn test_error_report_context() {
        let error = anyhow::anyhow!("disk full");
        let report = ErrorReport::new(&error)
            .with_context("job_id", "cleanup")
            .with_context("execution_uuid", "exec-1");

        assert_eq!(report.context.get("job_id").map(String::as_str), Some("cleanup"));
        assert_eq!(report.error.to_string(), "disk full");
        LogErrorReporter.report(report);
    }
}
