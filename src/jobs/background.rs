//! Background Job Module
//!
//! Enqueued work with the same isolation and lock vocabulary as periodic
//! jobs. A [`BackgroundJobProcessor`] owns a bounded queue and a fixed pool
//! of workers; each dequeued payload becomes one execution with its own
//! uuid, span and tracer transaction.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::jobs::execution::run_isolated;
use crate::jobs::{ExecutionContext, ExecutionOutcome, JobDependencies};
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::observability::log_execution;

// == Background Job Options ==
#[derive(Debug, Clone)]
pub struct BackgroundJobOptions {
    pub queue_id: String,
    /// Number of workers pulling from the queue
    pub concurrency: usize,
    /// Payloads buffered before `enqueue` waits for room
    pub queue_capacity: usize,
    /// Default lease for locks taken through the execution context
    pub lock_timeout: Duration,
    pub should_log_execution: bool,
}

impl BackgroundJobOptions {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            concurrency: 1,
            queue_capacity: 100,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            should_log_execution: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_log_execution(mut self, should_log_execution: bool) -> Self {
        self.should_log_execution = should_log_execution;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_id.trim().is_empty() {
            return Err(JobError::InvalidOptions("queue_id must not be empty".to_string()));
        }
        if self.concurrency == 0 || self.queue_capacity == 0 {
            return Err(JobError::InvalidOptions(format!(
                "queue '{}': concurrency and queue_capacity must be at least 1",
                self.queue_id
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(JobError::InvalidOptions(format!(
                "queue '{}': lock_timeout must be greater than zero",
                self.queue_id
            )));
        }
        Ok(())
    }
}

// == Background Job ==
#[async_trait]
pub trait BackgroundJob: Send + Sync + 'static {
    type Payload: Send + 'static;

    fn options(&self) -> &BackgroundJobOptions;

    /// Handles one payload. May be retried by the producer, so must be safe
    /// to repeat.
    async fn process_internal(
        &self,
        ctx: &ExecutionContext,
        payload: Self::Payload,
    ) -> anyhow::Result<()>;
}

struct Envelope<P> {
    execution_uuid: String,
    payload: P,
}

/// State shared by the workers. Holds no sender, so the queue closes as
/// soon as the processor lets go of its own.
struct Shared<J: BackgroundJob> {
    job: Arc<J>,
    options: BackgroundJobOptions,
    deps: JobDependencies,
}

impl<J: BackgroundJob> Shared<J> {
    async fn process(&self, execution_uuid: &str, payload: J::Payload) -> ExecutionOutcome {
        let span = info_span!(
            "background_job",
            queue_id = %self.options.queue_id,
            executor_id = %execution_uuid
        );

        async {
            let started = Instant::now();
            let ctx = ExecutionContext::new(
                self.options.queue_id.clone(),
                execution_uuid,
                self.deps.locks.clone(),
                self.options.lock_timeout,
            );

            self.deps.tracer.start(&self.options.queue_id, execution_uuid);
            let job = self.job.clone();
            let work_ctx = ctx.clone();
            let outcome = run_isolated(
                async move { job.process_internal(&work_ctx, payload).await },
                &self.deps,
                &ctx,
            )
            .await;
            self.deps.tracer.stop(execution_uuid);

            log_execution(
                self.options.should_log_execution,
                &self.options.queue_id,
                outcome.as_str(),
                started.elapsed().as_millis() as u64,
            );
            outcome
        }
        .instrument(span)
        .await
    }
}

type Queue<P> = Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope<P>>>>;

// == Background Job Processor ==
pub struct BackgroundJobProcessor<J: BackgroundJob> {
    shared: Arc<Shared<J>>,
    sender: Mutex<Option<mpsc::Sender<Envelope<J::Payload>>>>,
    receiver: Queue<J::Payload>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: BackgroundJob> BackgroundJobProcessor<J> {
    /// Validates the job's options and opens its queue. Nothing is consumed
    /// until [`start`](Self::start).
    pub fn new(job: J, deps: JobDependencies) -> Result<Self> {
        let options = job.options().clone();
        options.validate()?;

        let (sender, receiver) = mpsc::channel(options.queue_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                job: Arc::new(job),
                options,
                deps,
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn job(&self) -> &Arc<J> {
        &self.shared.job
    }

    pub fn options(&self) -> &BackgroundJobOptions {
        &self.shared.options
    }

    // == Start ==
    /// Spawns the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.lock_workers();
        if !workers.is_empty() {
            return;
        }

        for worker_id in 0..self.shared.options.concurrency {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                self.shared.clone(),
                self.receiver.clone(),
            )));
        }

        info!(
            queue_id = %self.shared.options.queue_id,
            workers = self.shared.options.concurrency,
            "Background job processor started"
        );
    }

    // == Enqueue ==
    /// Queues `payload` and returns the execution uuid it will run under.
    ///
    /// Waits for room when the queue is full. Fails with
    /// [`JobError::QueueClosed`] after [`dispose`](Self::dispose).
    pub async fn enqueue(&self, payload: J::Payload) -> Result<String> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| self.closed())?;

        let execution_uuid = Uuid::new_v4().to_string();
        sender
            .send(Envelope {
                execution_uuid: execution_uuid.clone(),
                payload,
            })
            .await
            .map_err(|_| self.closed())?;

        debug!(
            queue_id = %self.shared.options.queue_id,
            execution_uuid = %execution_uuid,
            "Payload enqueued"
        );
        Ok(execution_uuid)
    }

    /// Runs one payload inline, bypassing the queue.
    pub async fn process(&self, execution_uuid: &str, payload: J::Payload) -> ExecutionOutcome {
        self.shared.process(execution_uuid, payload).await
    }

    // == Dispose ==
    /// Closes the queue, lets the workers drain what is already queued and
    /// waits for them. Safe to call repeatedly.
    pub async fn dispose(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let workers: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        if workers.is_empty() {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            let mut dropped = 0usize;
            while receiver.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(
                    queue_id = %self.shared.options.queue_id,
                    dropped,
                    "Processor disposed before start, queued payloads dropped"
                );
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(
                    queue_id = %self.shared.options.queue_id,
                    error = %e,
                    "Worker ended abnormally"
                );
            }
        }

        debug!(queue_id = %self.shared.options.queue_id, "Background job processor disposed");
    }

    fn closed(&self) -> JobError {
        JobError::QueueClosed(self.shared.options.queue_id.clone())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop<J: BackgroundJob>(
    worker_id: usize,
    shared: Arc<Shared<J>>,
    receiver: Queue<J::Payload>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(envelope) = next else {
            break;
        };
        shared
            .process(&envelope.execution_uuid, envelope.payload)
            .await;
    }
    debug!(queue_id = %shared.options.queue_id, worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockProvider, MemoryLockStore};
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SummingJob {
        options: BackgroundJobOptions,
        total: AtomicUsize,
    }

    #[async_trait]
    impl BackgroundJob for SummingJob {
        type Payload = usize;

        fn options(&self) -> &BackgroundJobOptions {
            &self.options
        }

        async fn process_internal(
            &self,
            _ctx: &ExecutionContext,
            payload: usize,
        ) -> anyhow::Result<()> {
            if payload == 0 {
                anyhow::bail!("zero is not a valid amount");
            }
            self.total.fetch_add(payload, Ordering::SeqCst);
            Ok(())
        }
    }

    fn processor(concurrency: usize) -> BackgroundJobProcessor<SummingJob> {
        let deps = JobDependencies::new(
            LockProvider::new(Arc::new(MemoryLockStore::new())),
            Arc::new(TokioScheduler::new()),
        );
        let job = SummingJob {
            options: BackgroundJobOptions::new("sums").with_concurrency(concurrency),
            total: AtomicUsize::new(0),
        };
        BackgroundJobProcessor::new(job, deps).unwrap()
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(BackgroundJobOptions::new("").validate().is_err());
        assert!(BackgroundJobOptions::new("q").with_concurrency(0).validate().is_err());
        assert!(BackgroundJobOptions::new("q").with_queue_capacity(0).validate().is_err());
        assert!(BackgroundJobOptions::new("q")
            .with_lock_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BackgroundJobOptions::new("q").validate().is_ok());
    }

    #[tokio::test]
    async fn test_workers_drain_queue_before_dispose_returns() {
        let processor = processor(3);
        processor.start();

        for amount in 1..=10 {
            processor.enqueue(amount).await.unwrap();
        }
        processor.dispose().await;

        assert_eq!(processor.job().total.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn test_failed_payload_does_not_stop_workers() {
        let processor = processor(1);
        processor.start();

        processor.enqueue(0).await.unwrap();
        processor.enqueue(5).await.unwrap();
        processor.dispose().await;

        assert_eq!(processor.job().total.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_enqueue_after_dispose_fails() {
        let processor = processor(1);
        processor.start();
        processor.dispose().await;
        processor.dispose().await;

        let result = processor.enqueue(1).await;
        assert!(matches!(result, Err(JobError::QueueClosed(ref id)) if id == "sums"));
    }

    #[tokio::test]
    async fn test_inline_process_reports_outcome() {
        let processor = processor(1);

        assert_eq!(processor.process("exec-1", 3).await, ExecutionOutcome::Completed);
        assert!(processor.process("exec-2", 0).await.is_failed());
        assert_eq!(processor.job().total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_enqueue_returns_distinct_execution_ids() {
        let processor = processor(1);
        let first = processor.enqueue(1).await.unwrap();
        let second = processor.enqueue(2).await.unwrap();
        assert_ne!(first, second);

        processor.dispose().await;
        assert_eq!(processor.job().total.load(Ordering::SeqCst), 0);
    }
}
