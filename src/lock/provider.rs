//! Lock Provider Module
//!
//! Timed acquisition, self-refreshing leases and the handle an execution
//! holds while it owns a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::lock::LockStore;

// == Defaults ==
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Auto-refresh fires at this fraction of the lock timeout.
const REFRESH_RATIO: f64 = 0.8;

// == Lock Options ==
/// How a single acquisition behaves.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Maximum number of set-if-absent attempts
    pub acquire_attempts_limit: u32,
    /// Give up once this much time has passed, whatever the attempt count
    pub acquire_timeout: Duration,
    /// Pause between attempts
    pub retry_interval: Duration,
    /// Lease duration written on acquire and on every refresh
    pub lock_timeout: Duration,
    /// `None` means 80% of `lock_timeout`; `Some(Duration::ZERO)` disables refresh
    pub refresh_interval: Option<Duration>,
    /// Owner identifier; a random UUID when absent
    pub identifier: Option<String>,
    /// Trust that `identifier` already owns the lock and only extend it
    pub acquired_externally: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquire_attempts_limit: u32::MAX,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            refresh_interval: None,
            identifier: None,
            acquired_externally: false,
        }
    }
}

impl LockOptions {
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_acquire_attempts_limit(mut self, limit: u32) -> Self {
        self.acquire_attempts_limit = limit;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn acquired_externally(mut self) -> Self {
        self.acquired_externally = true;
        self
    }

    /// Refresh period actually used; zero means no auto-refresh.
    pub fn effective_refresh_interval(&self) -> Duration {
        self.refresh_interval
            .unwrap_or_else(|| self.lock_timeout.mul_f64(REFRESH_RATIO))
    }

    fn validate(&self) -> Result<(), LockError> {
        if self.lock_timeout.is_zero() {
            return Err(LockError::InvalidOptions(
                "lock_timeout must be greater than zero".to_string(),
            ));
        }
        if self.acquire_attempts_limit == 0 {
            return Err(LockError::InvalidOptions(
                "acquire_attempts_limit must be at least 1".to_string(),
            ));
        }
        if self.acquired_externally && self.identifier.is_none() {
            return Err(LockError::InvalidOptions(
                "acquired_externally requires an identifier".to_string(),
            ));
        }
        Ok(())
    }
}

// == Lock Provider ==
/// Entry point for taking named locks out of a shared [`LockStore`].
#[derive(Clone)]
pub struct LockProvider {
    store: Arc<dyn LockStore>,
    key_prefix: String,
}

impl LockProvider {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn resource_key(&self, resource: &str) -> String {
        format!("{}{}", self.key_prefix, resource)
    }

    // == Try Acquire ==
    /// Acquires `resource` according to `options`.
    ///
    /// Returns `Ok(None)` when the lock is held by someone else (or, for an
    /// externally acquired lock, when `identifier` turns out not to own it).
    /// Store failures come back as `Err`. On success the returned handle keeps
    /// the lease alive until refresh is stopped or the handle is dropped.
    pub async fn try_acquire(
        &self,
        resource: &str,
        options: LockOptions,
    ) -> Result<Option<LockHandle>, LockError> {
        options.validate()?;

        let key = self.resource_key(resource);
        let identifier = options
            .identifier
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let acquired = if options.acquired_externally {
            self.store
                .refresh(&key, &identifier, options.lock_timeout)
                .await?
        } else {
            self.acquire_with_retries(&key, &identifier, &options)
                .await?
        };

        if !acquired {
            debug!(
                key = %key,
                identifier = %identifier,
                externally = options.acquired_externally,
                "Lock not acquired"
            );
            return Ok(None);
        }

        Ok(Some(LockHandle::start(
            self.store.clone(),
            key,
            identifier,
            options.lock_timeout,
            options.effective_refresh_interval(),
        )))
    }

    async fn acquire_with_retries(
        &self,
        key: &str,
        identifier: &str,
        options: &LockOptions,
    ) -> Result<bool, LockError> {
        let deadline = Instant::now() + options.acquire_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self
                .store
                .try_acquire(key, identifier, options.lock_timeout)
                .await?
            {
                return Ok(true);
            }

            if attempts >= options.acquire_attempts_limit
                || Instant::now() + options.retry_interval > deadline
            {
                return Ok(false);
            }
            tokio::time::sleep(options.retry_interval).await;
        }
    }
}

impl std::fmt::Debug for LockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockProvider")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

// == Lease State ==
/// Lease bookkeeping shared between a handle and its refresh task.
#[derive(Debug)]
struct LeaseState {
    inner: Mutex<LeaseTimes>,
    refreshing: AtomicBool,
    lost: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct LeaseTimes {
    expiry: Instant,
    timeout: Duration,
}

impl LeaseState {
    fn new(timeout: Duration, refreshing: bool) -> Self {
        Self {
            inner: Mutex::new(LeaseTimes {
                expiry: Instant::now() + timeout,
                timeout,
            }),
            refreshing: AtomicBool::new(refreshing),
            lost: AtomicBool::new(false),
        }
    }

    fn times(&self) -> LeaseTimes {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn renew(&self, timeout: Duration) {
        let mut times = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        times.timeout = timeout;
        times.expiry = Instant::now() + timeout;
    }
}

// == Lock Handle ==
/// A held lock.
///
/// Dropping the handle stops auto-refresh but does not release the lock; the
/// lease then runs out on its own. Call [`LockHandle::release`] to delete it.
pub struct LockHandle {
    store: Arc<dyn LockStore>,
    resource_key: String,
    identifier: String,
    lease: Arc<LeaseState>,
    refresher: Option<JoinHandle<()>>,
    stop: Arc<Notify>,
}

impl LockHandle {
    fn start(
        store: Arc<dyn LockStore>,
        resource_key: String,
        identifier: String,
        lock_timeout: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let refreshing = !refresh_interval.is_zero();
        let lease = Arc::new(LeaseState::new(lock_timeout, refreshing));
        let stop = Arc::new(Notify::new());

        let refresher = refreshing.then(|| {
            tokio::spawn(refresh_loop(
                store.clone(),
                resource_key.clone(),
                identifier.clone(),
                refresh_interval,
                lease.clone(),
                stop.clone(),
            ))
        });

        Self {
            store,
            resource_key,
            identifier,
            lease,
            refresher,
            stop,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Owner identifier written into the store.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Lease duration used by the last successful write.
    pub fn lock_timeout(&self) -> Duration {
        self.lease.times().timeout
    }

    /// Local estimate of when the lease lapses.
    pub fn lease_expiry(&self) -> Instant {
        self.lease.times().expiry
    }

    pub fn is_refreshing(&self) -> bool {
        self.lease.refreshing.load(Ordering::SeqCst)
    }

    /// True once a refresh found the lease gone or owned by someone else.
    pub fn is_lost(&self) -> bool {
        self.lease.lost.load(Ordering::SeqCst)
    }

    // == Stop Refresh ==
    /// Aborts auto-refresh immediately.
    ///
    /// A refresh command already sent to the store may still land afterwards.
    /// Use [`finish_refresh`](Self::finish_refresh) before rewriting the lease.
    pub fn stop_refresh(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        self.lease.refreshing.store(false, Ordering::SeqCst);
    }

    /// Stops auto-refresh and waits for an in-flight refresh to land.
    ///
    /// Once this returns no refresh of this handle can overwrite a later
    /// [`update_timeout`](Self::update_timeout). A refresh that takes longer
    /// than the lease timeout is aborted instead.
    pub async fn finish_refresh(&mut self) {
        if let Some(mut refresher) = self.refresher.take() {
            self.stop.notify_one();
            let grace = self.lock_timeout();
            if tokio::time::timeout(grace, &mut refresher).await.is_err() {
                warn!(key = %self.resource_key, "Lease refresh still running, aborting it");
                refresher.abort();
            }
        }
        self.lease.refreshing.store(false, Ordering::SeqCst);
    }

    // == Update Timeout ==
    /// Rewrites the lease to `lock_timeout` from now, if still owned.
    ///
    /// A running refresh task adopts the new timeout on its next tick.
    pub async fn update_timeout(&mut self, lock_timeout: Duration) -> Result<bool, LockError> {
        let updated = self
            .store
            .refresh(&self.resource_key, &self.identifier, lock_timeout)
            .await?;

        if updated {
            self.lease.renew(lock_timeout);
        } else {
            self.lease.lost.store(true, Ordering::SeqCst);
        }
        Ok(updated)
    }

    // == Release ==
    /// Stops refresh and deletes the lock if still owned.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.stop_refresh();
        self.store
            .release(&self.resource_key, &self.identifier)
            .await
    }

    /// A detached capability to release this lease later, e.g. on shutdown.
    pub fn lease_token(&self) -> LeaseToken {
        LeaseToken {
            store: self.store.clone(),
            resource_key: self.resource_key.clone(),
            identifier: self.identifier.clone(),
            refresher: self.refresher.as_ref().map(JoinHandle::abort_handle),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_key", &self.resource_key)
            .field("identifier", &self.identifier)
            .field("lease_expiry", &self.lease_expiry())
            .field("is_refreshing", &self.is_refreshing())
            .finish()
    }
}

// == Lease Token ==
/// Owner-checked release of a lease without access to its handle.
#[derive(Clone)]
pub struct LeaseToken {
    store: Arc<dyn LockStore>,
    resource_key: String,
    identifier: String,
    refresher: Option<AbortHandle>,
}

impl LeaseToken {
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub async fn release(&self) -> Result<bool, LockError> {
        if let Some(refresher) = &self.refresher {
            refresher.abort();
        }
        self.store
            .release(&self.resource_key, &self.identifier)
            .await
    }
}

impl std::fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseToken")
            .field("resource_key", &self.resource_key)
            .field("identifier", &self.identifier)
            .finish()
    }
}

// == Refresh Loop ==
async fn refresh_loop(
    store: Arc<dyn LockStore>,
    key: String,
    identifier: String,
    interval: Duration,
    lease: Arc<LeaseState>,
    stop: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A stop requested mid-refresh is kept as a permit and seen here
        tokio::select! {
            biased;
            _ = stop.notified() => break,
            _ = ticker.tick() => {}
        }
        let timeout = lease.times().timeout;

        match store.refresh(&key, &identifier, timeout).await {
            Ok(true) => {
                lease.renew(timeout);
                trace!(key = %key, "Lease refreshed");
            }
            Ok(false) => {
                warn!(key = %key, identifier = %identifier, "Lease lost, stopping refresh");
                lease.lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lease refresh failed, retrying on next tick");
            }
        }
    }

    lease.refreshing.store(false, Ordering::SeqCst);
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use async_trait::async_trait;

    fn provider() -> (MemoryLockStore, LockProvider) {
        let store = MemoryLockStore::new();
        let provider = LockProvider::new(Arc::new(store.clone()));
        (store, provider)
    }

    fn single_attempt(timeout: Duration) -> LockOptions {
        LockOptions::default()
            .with_acquire_attempts_limit(1)
            .with_lock_timeout(timeout)
    }

    #[test]
    fn test_default_refresh_interval_is_eighty_percent() {
        let options = LockOptions::default().with_lock_timeout(Duration::from_secs(10));
        assert_eq!(options.effective_refresh_interval(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let (_, provider) = provider();

        let zero_timeout = LockOptions::default().with_lock_timeout(Duration::ZERO);
        assert!(matches!(
            provider.try_acquire("r", zero_timeout).await,
            Err(LockError::InvalidOptions(_))
        ));

        let anonymous_external = LockOptions::default().acquired_externally();
        assert!(matches!(
            provider.try_acquire("r", anonymous_external).await,
            Err(LockError::InvalidOptions(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_uses_identifier_and_prefix() {
        let (store, provider) = provider();
        let provider = provider.with_key_prefix("svc:");

        let handle = provider
            .try_acquire(
                "job:locks:exclusive",
                single_attempt(Duration::from_secs(2)).with_identifier("exec-1"),
            )
            .await
            .unwrap()
            .expect("lock should be free");

        assert_eq!(handle.resource_key(), "svc:job:locks:exclusive");
        assert_eq!(handle.identifier(), "exec-1");
        assert_eq!(
            store.owner_of("svc:job:locks:exclusive").await.as_deref(),
            Some("exec-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_fails_fast_on_contention() {
        let (_, provider) = provider();
        let _held = provider
            .try_acquire("r", single_attempt(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        let started = Instant::now();
        let second = provider
            .try_acquire("r", single_attempt(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(second.is_none());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_lease_lapses() {
        let (_, provider) = provider();
        let mut held = provider
            .try_acquire("r", single_attempt(Duration::from_millis(50)))
            .await
            .unwrap()
            .unwrap();
        held.stop_refresh();

        let waiting = LockOptions::default().with_lock_timeout(Duration::from_secs(1));
        let second = provider.try_acquire("r", waiting).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_keeps_lease_alive() {
        let (store, provider) = provider();
        let handle = provider
            .try_acquire("r", single_attempt(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(handle.is_refreshing());
        assert!(!handle.is_lost());
        assert_eq!(store.owner_of("r").await.as_deref(), Some(handle.identifier()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_refresh_lets_lease_lapse() {
        let (store, provider) = provider();
        let mut handle = provider
            .try_acquire("r", single_attempt(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        handle.stop_refresh();
        assert!(!handle.is_refreshing());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.owner_of("r").await.is_none());
    }

    /// Delays the first refresh on a detached task, like a command already
    /// on the wire that outlives whoever sent it.
    struct SlowFirstRefreshStore {
        inner: MemoryLockStore,
        slow_first: AtomicBool,
    }

    #[async_trait]
    impl LockStore for SlowFirstRefreshStore {
        async fn try_acquire(
            &self,
            key: &str,
            owner: &str,
            ttl: Duration,
        ) -> Result<bool, LockError> {
            self.inner.try_acquire(key, owner, ttl).await
        }

        async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
            if !self.slow_first.swap(false, Ordering::SeqCst) {
                return self.inner.refresh(key, owner, ttl).await;
            }

            let inner = self.inner.clone();
            let (key, owner) = (key.to_string(), owner.to_string());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                inner.refresh(&key, &owner, ttl).await
            })
            .await
            .unwrap()
        }

        async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
            self.inner.release(key, owner).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_refresh_waits_for_in_flight_refresh() {
        let inner = MemoryLockStore::new();
        let store = Arc::new(SlowFirstRefreshStore {
            inner: inner.clone(),
            slow_first: AtomicBool::new(true),
        });
        let provider = LockProvider::new(store);
        let mut handle = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(1))
                    .with_refresh_interval(Duration::from_millis(100)),
            )
            .await
            .unwrap()
            .unwrap();

        // First refresh is sent at 100ms and lands at 600ms
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.finish_refresh().await;
        assert!(!handle.is_refreshing());

        let cool_down = Duration::from_millis(300);
        assert!(handle.update_timeout(cool_down).await.unwrap());
        assert_eq!(inner.ttl_remaining("r").await, Some(cool_down));

        // The in-flight refresh must not have stretched the cool-down back to 1s
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(inner.owner_of("r").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_refresh_without_refresher() {
        let (store, provider) = provider();
        let mut handle = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(1)).with_refresh_interval(Duration::ZERO),
            )
            .await
            .unwrap()
            .unwrap();

        handle.finish_refresh().await;
        assert!(!handle.is_refreshing());
        assert_eq!(store.owner_of("r").await.as_deref(), Some(handle.identifier()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_does_not_release() {
        let (store, provider) = provider();
        let handle = provider
            .try_acquire("r", single_attempt(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        let owner = handle.identifier().to_string();
        drop(handle);

        assert_eq!(store.owner_of("r").await, Some(owner));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.owner_of("r").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_externally_acquired_extends_same_entry() {
        let (store, provider) = provider();
        let mut first = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(2)).with_identifier("exec-1"),
            )
            .await
            .unwrap()
            .unwrap();
        first.stop_refresh();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let renewed = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(2))
                    .with_identifier("exec-1")
                    .acquired_externally(),
            )
            .await
            .unwrap();

        assert!(renewed.is_some());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.ttl_remaining("r").await, Some(Duration::from_secs(2)));
        assert_eq!(store.stats().await.acquisitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_externally_acquired_refused_for_other_owner() {
        let (_, provider) = provider();
        let _held = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(2)).with_identifier("exec-1"),
            )
            .await
            .unwrap()
            .unwrap();

        let stolen = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(2))
                    .with_identifier("exec-2")
                    .acquired_externally(),
            )
            .await
            .unwrap();
        assert!(stolen.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_timeout_rewrites_lease() {
        let (store, provider) = provider();
        let mut handle = provider
            .try_acquire("r", single_attempt(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();

        handle.stop_refresh();
        assert!(handle.update_timeout(Duration::from_secs(60)).await.unwrap());
        assert_eq!(handle.lock_timeout(), Duration::from_secs(60));
        assert_eq!(store.ttl_remaining("r").await, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_detects_lost_lease() {
        let (store, provider) = provider();
        let handle = provider
            .try_acquire(
                "r",
                single_attempt(Duration::from_secs(1)).with_identifier("exec-1"),
            )
            .await
            .unwrap()
            .unwrap();

        // Someone force-releases and takes over between refresh ticks.
        assert!(store.release("r", "exec-1").await.unwrap());
        assert!(store
            .try_acquire("r", "exec-2", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_lost());
        assert!(!handle.is_refreshing());
        assert_eq!(store.owner_of("r").await.as_deref(), Some("exec-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_and_lease_token() {
        let (store, provider) = provider();
        let handle = provider
            .try_acquire("a", single_attempt(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.release().await.unwrap());
        assert!(store.owner_of("a").await.is_none());

        let handle = provider
            .try_acquire("b", single_attempt(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        let token = handle.lease_token();
        assert!(token.release().await.unwrap());
        assert!(!token.release().await.unwrap());
        assert!(store.owner_of("b").await.is_none());
    }
}
