//! Log file digestion.
//!
//! Each tick the leader walks the pending files and takes a second lock per
//! file, `log:{file_id}`. That lock is never released: once the file is
//! processed its lease simply runs out, and a file whose processing failed
//! becomes eligible again the same way.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::jobs::{
    ExclusiveLockRequest, ExecutionContext, JobOptions, JobSchedule, PeriodicJob,
    SingleConsumerMode,
};

pub const PROCESS_LOG_FILES_JOB_ID: &str = "process-log-files";

/// Lease on a single file; long enough to read and digest it.
pub const DEFAULT_FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

pub fn file_lock_name(file_id: &str) -> String {
    format!("log:{file_id}")
}

/// One JSON line of a log file.
#[derive(Debug, Clone, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub file_id: String,
    pub lines: usize,
    pub errors: usize,
    pub warnings: usize,
    /// Lines that were not valid JSON log records
    pub malformed: usize,
}

impl LogSummary {
    pub fn from_contents(file_id: &str, contents: &str) -> Self {
        let mut summary = Self {
            file_id: file_id.to_string(),
            ..Self::default()
        };

        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            summary.lines += 1;
            match serde_json::from_str::<LogLine>(line) {
                Ok(record) => match record.level.to_ascii_lowercase().as_str() {
                    "error" => summary.errors += 1,
                    "warn" | "warning" => summary.warnings += 1,
                    _ => {}
                },
                Err(_) => summary.malformed += 1,
            }
        }
        summary
    }
}

#[async_trait]
pub trait LogFileSource: Send + Sync {
    async fn list_pending(&self) -> anyhow::Result<Vec<String>>;
    async fn read(&self, file_id: &str) -> anyhow::Result<String>;
    async fn mark_processed(&self, summary: LogSummary) -> anyhow::Result<()>;
}

/// Files held in memory, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogFileSource {
    pending: Arc<RwLock<BTreeMap<String, String>>>,
    processed: Arc<RwLock<HashMap<String, LogSummary>>>,
    /// Number of times each file has been digested
    reads: Arc<RwLock<HashMap<String, usize>>>,
}

impl InMemoryLogFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_file(&self, file_id: impl Into<String>, contents: impl Into<String>) {
        self.pending.write().await.insert(file_id.into(), contents.into());
    }

    pub async fn summary(&self, file_id: &str) -> Option<LogSummary> {
        self.processed.read().await.get(file_id).cloned()
    }

    pub async fn read_count(&self, file_id: &str) -> usize {
        self.reads.read().await.get(file_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LogFileSource for InMemoryLogFileSource {
    async fn list_pending(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.pending.read().await.keys().cloned().collect())
    }

    async fn read(&self, file_id: &str) -> anyhow::Result<String> {
        *self.reads.write().await.entry(file_id.to_string()).or_default() += 1;
        self.pending
            .read()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("log file '{file_id}' not found"))
    }

    async fn mark_processed(&self, summary: LogSummary) -> anyhow::Result<()> {
        self.pending.write().await.remove(&summary.file_id);
        self.processed
            .write()
            .await
            .insert(summary.file_id.clone(), summary);
        Ok(())
    }
}

pub struct ProcessLogFilesJob {
    options: JobOptions,
    source: Arc<dyn LogFileSource>,
    file_lock_timeout: Duration,
}

impl ProcessLogFilesJob {
    pub fn new(source: Arc<dyn LogFileSource>, schedule: JobSchedule) -> Self {
        Self {
            options: JobOptions::new(PROCESS_LOG_FILES_JOB_ID, schedule)
                .with_single_consumer_mode(SingleConsumerMode::enabled()),
            source,
            file_lock_timeout: DEFAULT_FILE_LOCK_TIMEOUT,
        }
    }

    pub fn with_file_lock_timeout(mut self, timeout: Duration) -> Self {
        self.file_lock_timeout = timeout;
        self
    }

    async fn digest(&self, file_id: &str) -> anyhow::Result<LogSummary> {
        let contents = self.source.read(file_id).await?;
        let summary = LogSummary::from_contents(file_id, &contents);
        self.source.mark_processed(summary.clone()).await?;
        Ok(summary)
    }
}

#[async_trait]
impl PeriodicJob for ProcessLogFilesJob {
    fn options(&self) -> &JobOptions {
        &self.options
    }

    async fn process_internal(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let mut failed = Vec::new();

        for file_id in self.source.list_pending().await? {
            let request = ExclusiveLockRequest::named(file_lock_name(&file_id))
                .with_lock_timeout(self.file_lock_timeout);

            let Some(mut lock) = ctx.try_acquire_exclusive_lock(request).await? else {
                debug!(file_id = %file_id, "Log file locked elsewhere, skipping");
                continue;
            };

            match self.digest(&file_id).await {
                Ok(summary) => info!(
                    file_id = %file_id,
                    lines = summary.lines,
                    errors = summary.errors,
                    "Log file processed"
                ),
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "Log file processing failed");
                    failed.push(file_id);
                }
            }
            // The lease stays; it expires on its own.
            lock.stop_refresh();
        }

        if !failed.is_empty() {
            anyhow::bail!("failed to process log files: {}", failed.join(", "));
        }
        Ok(())
    }
}
