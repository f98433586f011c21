//! Lock Table Module
//!
//! Synchronous lease table with set-if-absent, owner-checked refresh and
//! owner-checked release. Every operation takes the current instant so the
//! table can be driven by a simulated clock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::lock::{LockEntry, LockStats};

// == Lock Table ==
#[derive(Debug, Default)]
pub struct LockTable {
    /// Leases keyed by resource key
    entries: HashMap<String, LockEntry>,
    /// Operation counters
    stats: LockStats,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // == Try Acquire ==
    /// Grants the lease to `owner` only if no live lease exists for `key`.
    ///
    /// An expired lease counts as absent and is replaced. Re-acquiring a key
    /// the same owner already holds is refused, exactly like a store-level
    /// set-if-absent would.
    pub fn try_acquire(&mut self, key: &str, owner: &str, ttl: Duration, now: Instant) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired_at(now) {
                self.stats.record_contention();
                return false;
            }
            self.stats.record_expirations(1);
        }

        self.entries
            .insert(key.to_string(), LockEntry::new(owner.to_string(), ttl, now));
        self.stats.record_acquisition();
        self.stats.set_active_locks(self.entries.len());
        true
    }

    // == Refresh ==
    /// Rewrites the lease expiry to `now + ttl` if `owner` holds a live lease.
    pub fn refresh(&mut self, key: &str, owner: &str, ttl: Duration, now: Instant) -> bool {
        self.evict_if_expired(key, now);

        match self.entries.get_mut(key) {
            Some(entry) if entry.is_owned_by(owner) => {
                entry.extend(ttl, now);
                self.stats.record_refresh();
                true
            }
            _ => {
                self.stats.record_refresh_miss();
                false
            }
        }
    }

    // == Release ==
    /// Deletes the lease if `owner` holds it. Never touches another owner's lease.
    pub fn release(&mut self, key: &str, owner: &str, now: Instant) -> bool {
        self.evict_if_expired(key, now);

        let owned = self
            .entries
            .get(key)
            .map(|entry| entry.is_owned_by(owner))
            .unwrap_or(false);
        if !owned {
            return false;
        }

        self.entries.remove(key);
        self.stats.record_release();
        self.stats.set_active_locks(self.entries.len());
        true
    }

    // == Inspection ==
    /// Current live owner of `key`, if any.
    pub fn owner_of(&self, key: &str, now: Instant) -> Option<&str> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.owner.as_str())
    }

    /// Remaining lease time of `key`, if a live lease exists.
    pub fn ttl_remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.ttl_remaining_at(now))
    }

    // == Cleanup Expired ==
    /// Removes every lapsed lease. Returns how many were removed.
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - self.entries.len();

        self.stats.record_expirations(removed);
        self.stats.set_active_locks(self.entries.len());
        removed
    }

    pub fn stats(&self) -> LockStats {
        let mut stats = self.stats.clone();
        stats.set_active_locks(self.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired_at(now))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.stats.record_expirations(1);
            self.stats.set_active_locks(self.entries.len());
        }
    }
}
