//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal summary of a block, enough to track the local head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Number of transactions in the block.
    pub tx_count: u32,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Chain input ──────────────────────────────────────────────────────────────

/// A transaction as delivered by the block source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub tx_hash: String,
    /// Execution position reported by the chain. Only trusted from the
    /// configured sort-order upgrade height onward.
    pub transaction_index: u32,
    /// Raw entity-manager payload.
    pub payload: serde_json::Value,
}

/// A full block as delivered by the block source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    #[serde(default)]
    pub timestamp: i64,
    /// Slot of the block on chains that expose one.
    #[serde(default)]
    pub slot: Option<u64>,
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
}

impl ChainBlock {
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            number: self.number,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
            tx_count: self.transactions.len() as u32,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            blockhash: self.hash.clone(),
            blocknumber: self.number,
            slot: self.slot,
        }
    }
}

// ─── Persisted blocks ─────────────────────────────────────────────────────────

/// A block row as recorded by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedBlock {
    pub blockhash: String,
    pub parenthash: String,
    pub number: u64,
    /// Exactly one indexed block is current: the local head.
    pub is_current: bool,
}

impl IndexedBlock {
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            number: self.number,
            hash: self.blockhash.clone(),
            parent_hash: self.parenthash.clone(),
            timestamp: 0,
            tx_count: 0,
        }
    }
}

/// Where a version row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub blockhash: String,
    pub blocknumber: u64,
    pub slot: Option<u64>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
