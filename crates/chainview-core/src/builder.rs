//! Fluent builder API for indexer configuration.
//!
//! # Example
//!
//! ```rust
//! use chainview_core::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .id("discovery-1")
//!     .start_block(1_000)
//!     .tx_index_sort_start_block(25_000)
//!     .verifier(42)
//!     .build_config();
//! assert_eq!(config.start_block, 1_000);
//! ```

use crate::config::IndexerConfig;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing config (e.g. one loaded from disk).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the indexer ID (used as the lease holder).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the first block indexed on an empty database.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set the height from which transactions are ordered by chain index.
    pub fn tx_index_sort_start_block(mut self, block: u64) -> Self {
        self.config.tx_index_sort_start_block = block;
        self
    }

    pub fn max_blocks_per_pass(mut self, n: u64) -> Self {
        self.config.max_blocks_per_pass = n;
        self
    }

    /// Set the block indexer tick in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn lock_ttl_secs(mut self, secs: u64) -> Self {
        self.config.lock_ttl_secs = secs;
        self
    }

    /// Set how many attempts a transient failure gets before the tx is skipped.
    pub fn node_skip_retry_limit(mut self, n: u32) -> Self {
        self.config.node_skip_retry_limit = n;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Allow `user_id` to sign verification transactions.
    pub fn verifier(mut self, user_id: u64) -> Self {
        self.config.verifier_user_ids.push(user_id);
        self
    }

    pub fn challenge_batch_size(mut self, n: u32) -> Self {
        self.config.challenge_batch_size = n;
        self
    }

    pub fn challenge_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.challenge_poll_interval_ms = ms;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }
}
