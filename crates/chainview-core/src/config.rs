//! Indexer configuration and state types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used as the lease holder id).
    pub id: String,
    /// First block to index when nothing has been indexed yet.
    pub start_block: u64,
    /// Height from which chain-reported transaction indexes order a block.
    pub tx_index_sort_start_block: u64,
    /// Upper bound on blocks applied per pass.
    pub max_blocks_per_pass: u64,
    /// Block indexer tick interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Time-to-live of the worker leases (seconds).
    pub lock_ttl_secs: u64,
    /// Attempts before a transiently failing transaction is skipped at node level.
    pub node_skip_retry_limit: u32,
    /// Deepest reorg a single pass will revert before aborting.
    pub max_reorg_depth: u64,
    /// Users allowed to sign verification transactions.
    pub verifier_user_ids: Vec<u64>,
    /// Challenge events read per bus pass.
    pub challenge_batch_size: u32,
    /// Challenge job tick interval (milliseconds).
    pub challenge_poll_interval_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            start_block: 0,
            tx_index_sort_start_block: 0,
            max_blocks_per_pass: 100,
            poll_interval_ms: 1000,
            lock_ttl_secs: 600,
            node_skip_retry_limit: 3,
            max_reorg_depth: 1000,
            verifier_user_ids: vec![],
            challenge_batch_size: 500,
            challenge_poll_interval_ms: 5000,
        }
    }
}

impl IndexerConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the indexer cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.max_blocks_per_pass == 0 {
            return Err(IndexerError::Config("max_blocks_per_pass must be > 0".into()));
        }
        if self.lock_ttl_secs == 0 {
            return Err(IndexerError::Config("lock_ttl_secs must be > 0".into()));
        }
        if self.challenge_batch_size == 0 {
            return Err(IndexerError::Config("challenge_batch_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn is_verifier(&self, user_id: u64) -> bool {
        self.verifier_user_ids.contains(&user_id)
    }
}

/// Runtime state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Applying blocks behind the source head.
    Indexing,
    /// Reverting orphaned blocks.
    ReorgRecovery,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Indexing => write!(f, "indexing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
