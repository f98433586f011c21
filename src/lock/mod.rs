//! Distributed Lock Module
//!
//! Lease-based mutual exclusion over a shared key-value store.
//!
//! - [`LockStore`]: the three atomic primitives a backend must offer
//! - [`MemoryLockStore`]: process-local backend on top of [`LockTable`]
//! - `RedisLockStore`: Redis backend (feature `redis`)
//! - [`LockProvider`]: timed acquisition returning self-refreshing [`LockHandle`]s

mod entry;
mod provider;
#[cfg(feature = "redis")]
mod redis;
mod stats;
mod store;
mod table;


// Re-export public types
pub use entry::LockEntry;
pub use provider::{
    LeaseToken, LockHandle, LockOptions, LockProvider, DEFAULT_ACQUIRE_TIMEOUT,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_INTERVAL,
};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use stats::LockStats;
pub use store::{LockStore, MemoryLockStore};
pub use table::LockTable;
