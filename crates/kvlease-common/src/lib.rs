//! kvlease Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all kvlease components:
//! - The stored item model and CAS expectations/conditions
//! - Error taxonomy and error codes
//! - Clocks used to evaluate logical expiration
//! - Store configuration and its validation

pub mod clock;
pub mod config;
pub mod error;
pub mod model;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::StoreConfig;
pub use error::{ErrorCode, KvError, Result};
pub use model::*;

/// Default lease TTL applied when a lock is created without one
pub const DEFAULT_LOCK_TTL_MS: u64 = 20_000;

/// Maximum time a tree deletion keeps resubmitting unprocessed keys
pub const DELETE_TREE_TIMEOUT_SECONDS: u64 = 30;

/// Default upper bound for a single prefix scan
pub const DEFAULT_SCAN_TIMEOUT_SECONDS: u64 = 10;
