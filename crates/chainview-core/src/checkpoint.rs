//! Checkpoints: the durable resumption position of each ingestion stream.
//!
//! A checkpoint is only ever advanced in the same database transaction as the
//! writes it guards, so after a crash a block is either fully visible or not
//! applied at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream advanced by the block indexer (last fully applied block number).
pub const ENTITY_MANAGER_STREAM: &str = "entity_manager";

/// Stream advanced by the challenge bus (last processed event id).
pub const CHALLENGE_EVENTS_STREAM: &str = "challenge_events";

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream: String,
    /// Last successfully processed position.
    pub last_checkpoint: u64,
    pub updated_at: DateTime<Utc>,
}
