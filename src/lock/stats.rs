//! Lock Statistics Module
//!
//! Counters describing how contended the in-memory lock table is.

use serde::Serialize;

// == Lock Stats ==
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockStats {
    /// Successful fresh acquisitions
    pub acquisitions: u64,
    /// Acquisitions refused because a live lease exists
    pub contentions: u64,
    /// Successful owner-checked extensions
    pub refreshes: u64,
    /// Extensions refused (wrong owner or lease gone)
    pub refresh_misses: u64,
    /// Owner-checked deletions
    pub releases: u64,
    /// Leases that lapsed and were removed
    pub expirations: u64,
    /// Leases currently stored
    pub active_locks: usize,
}

impl LockStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Contention Rate ==
    /// Share of acquisition attempts that found the lock taken.
    ///
    /// Returns 0.0 when nothing has been attempted yet.
    pub fn contention_rate(&self) -> f64 {
        let total = self.acquisitions + self.contentions;
        if total == 0 {
            0.0
        } else {
            self.contentions as f64 / total as f64
        }
    }

    pub fn record_acquisition(&mut self) {
        self.acquisitions += 1;
    }

    pub fn record_contention(&mut self) {
        self.contentions += 1;
    }

    pub fn record_refresh(&mut self) {
        self.refreshes += 1;
    }

    pub fn record_refresh_miss(&mut self) {
        self.refresh_misses += 1;
    }

    pub fn record_release(&mut self) {
        self.releases += 1;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub fn set_active_locks(&mut self, count: usize) {
        self.active_locks = count;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = LockStats::new();
        assert_eq!(stats.acquisitions, 0);
        assert_eq!(stats.contentions, 0);
        assert_eq!(stats.active_locks, 0);
    }

    #[test]
    fn test_contention_rate_no_attempts() {
        assert_eq!(LockStats::new().contention_rate(), 0.0);
    }

    #[test]
    fn test_contention_rate_mixed() {
        let mut stats = LockStats::new();
        stats.record_acquisition();
        stats.record_contention();
        stats.record_contention();
        stats.record_acquisition();
        assert_eq!(stats.contention_rate(), 0.5);
    }

    #[test]
    fn test_record_expirations_accumulates() {
        let mut stats = LockStats::new();
        stats.record_expirations(2);
        stats.record_expirations(3);
        assert_eq!(stats.expirations, 5);
    }
}
