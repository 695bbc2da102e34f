//! chainview-storage — SQLite persistence for ChainView.
//!
//! Modules:
//! - [`sqlite`] — pool setup and schema
//! - [`checkpoint`] — per-stream resumption positions
//! - [`blocks`] — indexed blocks and the local head
//! - [`versions`] — versioned entity rows
//! - [`revert`] — head revert and the revert log
//! - [`skipped`] — skipped-transaction log
//! - [`challenges`] — challenge definitions, progress, payouts, event log
//! - `redis_lease` — Redis lease backend (feature `redis`)

pub mod blocks;
pub mod challenges;
pub mod checkpoint;
pub mod revert;
pub mod skipped;
pub mod sqlite;
pub mod versions;

#[cfg(feature = "redis")]
pub mod redis_lease;

pub use revert::{RevertAction, RevertRecord, RevertReport};
pub use skipped::{SkipLevel, SkippedTransaction};
pub use sqlite::SqliteStorage;

#[cfg(feature = "redis")]
pub use redis_lease::RedisLease;
