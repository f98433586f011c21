//! Background Tasks Module
//!
//! Housekeeping tasks that run for the lifetime of the host process.
//!
//! # Tasks
//! - Lease Cleanup: sweeps lapsed leases out of the in-memory lock store

mod cleanup;

pub use cleanup::spawn_cleanup_task;
