//! Block source abstraction and an in-memory chain.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;

use chainview_core::error::IndexerError;
use chainview_core::types::ChainBlock;

/// Canonical chain as seen by this node.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Height of the canonical head (0 when the chain is empty).
    async fn head_number(&self) -> Result<u64, IndexerError>;

    /// The canonical block at `number`, if the source has it.
    async fn block(&self, number: u64) -> Result<Option<ChainBlock>, IndexerError>;
}

// ─── MemoryChain ──────────────────────────────────────────────────────────────

/// A canonical chain held in memory. Used by tests and by block-file replay.
#[derive(Debug, Default)]
pub struct MemoryChain {
    blocks: RwLock<BTreeMap<u64, ChainBlock>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: impl IntoIterator<Item = ChainBlock>) -> Self {
        Self {
            blocks: RwLock::new(blocks.into_iter().map(|b| (b.number, b)).collect()),
        }
    }

    /// Load a JSON array of blocks.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Source(format!("cannot read {}: {e}", path.display())))?;
        let blocks: Vec<ChainBlock> = serde_json::from_str(&raw)
            .map_err(|e| IndexerError::Source(format!("invalid block file {}: {e}", path.display())))?;
        Ok(Self::from_blocks(blocks))
    }

    /// Append or overwrite one block.
    pub async fn push(&self, block: ChainBlock) {
        self.blocks.write().await.insert(block.number, block);
    }

    /// Replace the chain from the first given block's height upward.
    ///
    /// Everything at or above that height is discarded first, which is how a
    /// reorg looks from the node's side.
    pub async fn replace_from(&self, blocks: Vec<ChainBlock>) {
        let mut chain = self.blocks.write().await;
        if let Some(first) = blocks.iter().map(|b| b.number).min() {
            chain.split_off(&first);
        }
        for block in blocks {
            chain.insert(block.number, block);
        }
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl BlockSource for MemoryChain {
    async fn head_number(&self) -> Result<u64, IndexerError> {
        Ok(self
            .blocks
            .read()
            .await
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn block(&self, number: u64) -> Result<Option<ChainBlock>, IndexerError> {
        Ok(self.blocks.read().await.get(&number).cloned())
    }
}
