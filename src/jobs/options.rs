//! Job descriptors.

use std::time::Duration;

use crate::error::{JobError, Result};
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::scheduler::CronSchedule;

// == Job Schedule ==
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Fixed cadence
    Interval {
        every: Duration,
        run_immediately: bool,
    },
    /// Cron expression
    Cron(CronSchedule),
}

impl JobSchedule {
    pub fn every(every: Duration) -> Self {
        Self::Interval {
            every,
            run_immediately: false,
        }
    }

    pub fn every_immediately(every: Duration) -> Self {
        Self::Interval {
            every,
            run_immediately: true,
        }
    }

    pub fn cron(expression: &str) -> Result<Self> {
        Ok(Self::Cron(CronSchedule::parse(expression)?))
    }

    /// Nominal gap between runs. For cron this is the gap between the next
    /// two firings.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Interval { every, .. } => Some(*every),
            Self::Cron(schedule) => schedule.period(),
        }
    }
}

// == Single Consumer Mode ==
/// Cluster-wide "at most one executor per tick" policy.
#[derive(Debug, Clone, Default)]
pub struct SingleConsumerMode {
    pub enabled: bool,
    /// Lease held while running; defaults to twice the job period
    pub lock_timeout: Option<Duration>,
    /// Cool-down lease left behind after a run; defaults to one job period
    pub lock_timeout_after_success: Option<Duration>,
}

impl SingleConsumerMode {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_lock_timeout_after_success(mut self, timeout: Duration) -> Self {
        self.lock_timeout_after_success = Some(timeout);
        self
    }
}

// == Job Options ==
/// Immutable description of a periodic job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub job_id: String,
    pub schedule: JobSchedule,
    pub single_consumer_mode: SingleConsumerMode,
    /// Log each execution at info level instead of debug
    pub should_log_execution: bool,
}

impl JobOptions {
    pub fn new(job_id: impl Into<String>, schedule: JobSchedule) -> Self {
        Self {
            job_id: job_id.into(),
            schedule,
            single_consumer_mode: SingleConsumerMode::disabled(),
            should_log_execution: true,
        }
    }

    pub fn with_single_consumer_mode(mut self, mode: SingleConsumerMode) -> Self {
        self.single_consumer_mode = mode;
        self
    }

    pub fn with_log_execution(mut self, should_log_execution: bool) -> Self {
        self.should_log_execution = should_log_execution;
        self
    }

    /// Lease duration while running. Twice the period, so a lease taken at
    /// one tick outlives the gap to the next one.
    pub fn lock_timeout(&self) -> Duration {
        self.single_consumer_mode.lock_timeout.unwrap_or_else(|| {
            self.schedule
                .period()
                .map(|period| period * 2)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT)
        })
    }

    /// Cool-down lease written after a run.
    pub fn lock_timeout_after_success(&self) -> Duration {
        self.single_consumer_mode
            .lock_timeout_after_success
            .unwrap_or_else(|| self.schedule.period().unwrap_or(DEFAULT_LOCK_TIMEOUT))
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(JobError::InvalidOptions("job_id must not be empty".to_string()));
        }
        if let JobSchedule::Interval { every, .. } = &self.schedule {
            if every.is_zero() {
                return Err(JobError::InvalidOptions(format!(
                    "job '{}': interval must be greater than zero",
                    self.job_id
                )));
            }
        }
        if self.lock_timeout().is_zero() || self.lock_timeout_after_success().is_zero() {
            return Err(JobError::InvalidOptions(format!(
                "job '{}': lock timeouts must be greater than zero",
                self.job_id
            )));
        }
        Ok(())
    }
}
