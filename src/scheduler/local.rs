//! In-process scheduler driven by tokio timers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{CronSchedule, Scheduler, Task, TaskOptions};

/// One tokio task per registered id.
///
/// Every run is spawned on its own task. With `prevent_overrun` the timer
/// loop waits for that run before looking at the next tick, and ticks that
/// passed in the meantime are skipped. Stopping a task stops its timer only;
/// a run already in progress completes on its own.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock_tasks()
            .get(id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_tasks().is_empty()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, id: String, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock_tasks().insert(id.clone(), handle) {
            debug!(task_id = %id, "Replacing previously registered task");
            previous.abort();
        }
    }
}

impl Scheduler for TokioScheduler {
    fn add_interval_task(
        &self,
        every: Duration,
        run_immediately: bool,
        task: Task,
        options: TaskOptions,
    ) {
        let start = if run_immediately {
            Instant::now()
        } else {
            Instant::now() + every
        };
        let prevent_overrun = options.prevent_overrun;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                dispatch(&task, prevent_overrun).await;
            }
        });

        debug!(
            task_id = %options.id,
            every_ms = every.as_millis() as u64,
            "Interval task registered"
        );
        self.insert(options.id, handle);
    }

    fn add_cron_task(&self, schedule: CronSchedule, task: Task, options: TaskOptions) {
        let prevent_overrun = options.prevent_overrun;
        let id = options.id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = schedule.delay_until_next(Utc::now()) else {
                    warn!(
                        task_id = %id,
                        expression = schedule.expression(),
                        "Cron schedule has no further firings"
                    );
                    break;
                };
                tokio::time::sleep(delay).await;
                dispatch(&task, prevent_overrun).await;
            }
        });

        debug!(task_id = %options.id, "Cron task registered");
        self.insert(options.id, handle);
    }

    fn stop_by_id(&self, id: &str) -> bool {
        match self.lock_tasks().remove(id) {
            Some(handle) => {
                handle.abort();
                debug!(task_id = %id, "Task stopped");
                true
            }
            None => false,
        }
    }

    fn stop(&self) {
        for (id, handle) in self.lock_tasks().drain() {
            handle.abort();
            debug!(task_id = %id, "Task stopped");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch(task: &Task, prevent_overrun: bool) {
    let run = tokio::spawn(task());
    if prevent_overrun {
        if let Err(e) = run.await {
            if e.is_panic() {
                warn!("Scheduled task panicked");
            }
        }
    }
}
