//! Lock store contract and the in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::LockError;
use crate::lock::{LockStats, LockTable};

/// Shared key-value store with atomic lease primitives.
///
/// Every mutation of lock state goes through these three operations; callers
/// never write keys directly.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `owner` with a TTL only if no live value exists.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Reset the TTL of `key` to `ttl` only if its value is `owner`.
    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if its value is `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError>;
}

// == Memory Lock Store ==
/// Process-local lock store.
///
/// Gives the same guarantees as the Redis store to everything sharing one
/// instance, which makes it the store of choice for single-node deployments
/// and for simulating several nodes in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    table: Arc<RwLock<LockTable>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn owner_of(&self, key: &str) -> Option<String> {
        let table = self.table.read().await;
        table.owner_of(key, Instant::now()).map(str::to_string)
    }

    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let table = self.table.read().await;
        table.ttl_remaining(key, Instant::now())
    }

    pub async fn stats(&self) -> LockStats {
        self.table.read().await.stats()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    /// Drops lapsed leases; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut table = self.table.write().await;
        table.cleanup_expired(Instant::now())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut table = self.table.write().await;
        Ok(table.try_acquire(key, owner, ttl, Instant::now()))
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut table = self.table.write().await;
        Ok(table.refresh(key, owner, ttl, Instant::now()))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut table = self.table.write().await;
        Ok(table.release(key, owner, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_lease_lifecycle() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(2);

        assert!(store.try_acquire("k", "a", ttl).await.unwrap());
        assert!(!store.try_acquire("k", "b", ttl).await.unwrap());
        assert_eq!(store.owner_of("k").await.as_deref(), Some("a"));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.refresh("k", "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.owner_of("k").await.as_deref(), Some("a"));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(store.owner_of("k").await.is_none());
        assert!(store.try_acquire("k", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_clones_share_state() {
        let node_a = MemoryLockStore::new();
        let node_b = node_a.clone();

        assert!(node_a
            .try_acquire("k", "a", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!node_b
            .try_acquire("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!node_b.release("k", "b").await.unwrap());
        assert!(node_a.release("k", "a").await.unwrap());
        assert_eq!(node_b.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_cleanup_expired() {
        let store = MemoryLockStore::new();
        store
            .try_acquire("k", "a", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.stats().await.expirations, 1);
    }
}
