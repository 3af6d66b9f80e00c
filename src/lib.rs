//! mvstate - multi-version state containers for a transactional storage engine
//!
//! This crate provides:
//! - Per-key version chains with snapshot reads and read-your-own-writes
//! - Sorted multi-key and single-row containers sharing one implementation
//! - Recovery replay in commit-marker order
//! - Consistent flush-time scans and diagnostic projections

pub mod config;
pub mod error;
pub mod storage;

pub use config::UnitConfig;
pub use error::{Error, Result};
