//! Lease Cleanup Task
//!
//! Background task that periodically sweeps lapsed leases out of the
//! in-memory lock store. Lapsed leases are already ignored by every lock
//! operation; sweeping only bounds memory.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lock::MemoryLockStore;

/// Spawns a background task that periodically removes lapsed leases.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let store = MemoryLockStore::new();
/// let cleanup_handle = spawn_cleanup_task(store.clone(), Duration::from_secs(30));
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(store: MemoryLockStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting lease cleanup task with interval of {} ms",
            interval.as_millis()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = store.cleanup_expired().await;
            let stats = store.stats().await;
            if removed > 0 {
                info!(
                    "Lease cleanup: removed {} lapsed leases, {} active, contention rate {:.2}",
                    removed,
                    stats.active_locks,
                    stats.contention_rate()
                );
            } else {
                debug!(
                    "Lease cleanup: no lapsed leases found, {} active, contention rate {:.2}",
                    stats.active_locks,
                    stats.contention_rate()
                );
            }
        }
    })
}
