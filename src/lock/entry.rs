//! Lock Entry Module
//!
//! A single lease held in the in-memory lock table.

use std::time::Duration;

use tokio::time::Instant;

// == Lock Entry ==
/// One live (or not yet swept) lease: who owns it and until when.
#[derive(Debug, Clone)]
pub struct LockEntry {
    /// Identifier of the current owner
    pub owner: String,
    /// When the lease lapses unless refreshed
    pub expires_at: Instant,
}

impl LockEntry {
    // == Constructor ==
    /// Creates a lease for `owner` lasting `ttl` from `now`.
    pub fn new(owner: String, ttl: Duration, now: Instant) -> Self {
        Self {
            owner,
            expires_at: now + ttl,
        }
    }

    // == Is Expired ==
    /// A lease is expired once `now` reaches its expiry instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    // == Is Owned By ==
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    // == Extend ==
    /// Rewrites the expiry to `now + ttl`.
    ///
    /// The new expiry may be shorter than the current one; callers use this
    /// both to renew a running lease and to swap it for a cool-down lease.
    pub fn extend(&mut self, ttl: Duration, now: Instant) {
        self.expires_at = now + ttl;
    }

    // == Time To Live ==
    /// Remaining lease time, saturating at zero.
    pub fn ttl_remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
