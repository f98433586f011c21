//! Redis-backed lock store.
//!
//! Acquisition is a plain `SET key owner NX PX ttl`. Refresh and release must
//! compare the owner and act in one round trip, so both run as Lua scripts.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::error::LockError;
use crate::lock::LockStore;

/// Extends the TTL only when the caller still owns the key.
/// Returns 1 when extended, 0 otherwise.
const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Deletes the key only when the caller still owns it.
/// Returns 1 when deleted, 0 otherwise.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Keys are used as given; [`LockProvider`](crate::lock::LockProvider) applies any prefix.
pub struct RedisLockStore {
    client: redis::Client,
}

impl RedisLockStore {
    /// Opens a client for `url`. No connection is made until the first command.
    pub fn open(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, LockError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.get_connection().await?;

        // SET ... NX returns "OK" if set, nil if the key exists
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.get_connection().await?;

        let script = redis::Script::new(REFRESH_SCRIPT);
        let result: i64 = script
            .key(key)
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut conn = self.get_connection().await?;

        let script = redis::Script::new(RELEASE_SCRIPT);
        let result: i64 = script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }
}

/// PX rejects zero, so sub-millisecond TTLs round up to 1ms.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
