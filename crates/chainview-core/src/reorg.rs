//! Fork detection against the locally indexed head.
//!
//! Two scenarios trigger a revert of the local head:
//! 1. **Head orphaned**: the canonical block at the head's height has a different hash
//! 2. **Parent mismatch**: the next canonical block does not build on the head
//!
//! The detector only classifies. Reverting is done one head block at a time by
//! the revert manager in storage until the head is canonical again.

use crate::types::BlockSummary;

/// Describes a chain reorganization that has been handled.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the local head when the fork was detected.
    pub detected_at: u64,
    /// The blocks that were reverted, most recent first.
    pub reverted_blocks: Vec<BlockSummary>,
    /// Number of blocks reverted.
    pub depth: u64,
    /// How the fork was first noticed.
    pub reorg_type: ReorgType,
}

/// Classification of the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// The canonical block at the head height has a different hash.
    HeadOrphaned,
    /// The next canonical block's parent hash differs from the head hash.
    ParentMismatch,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeadOrphaned => write!(f, "head orphaned"),
            Self::ParentMismatch => write!(f, "parent mismatch"),
        }
    }
}

/// Result of comparing the local head to the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkCheck {
    /// Nothing indexed yet.
    Genesis,
    /// The local head is canonical (and the next block, if known, extends it).
    Canonical,
    /// The local head must be reverted.
    Fork(ReorgType),
}

/// Detects forks and bounds how deep a single recovery may go.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
    max_depth: u64,
}

impl ReorgDetector {
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Compare the local head with the canonical chain.
    ///
    /// `canonical_at_head` is the source's block at the head's height (`None`
    /// when the source is behind the local head). `next` is the source's block
    /// at `head + 1`, if it exists yet.
    pub fn check(
        &self,
        local_head: Option<&BlockSummary>,
        canonical_at_head: Option<&BlockSummary>,
        next: Option<&BlockSummary>,
    ) -> ForkCheck {
        let Some(head) = local_head else {
            return ForkCheck::Genesis;
        };

        if let Some(canonical) = canonical_at_head {
            if canonical.hash != head.hash {
                tracing::warn!(
                    at = head.number,
                    local = %head.hash,
                    canonical = %canonical.hash,
                    reorg_type = %ReorgType::HeadOrphaned,
                    "Reorg detected"
                );
                return ForkCheck::Fork(ReorgType::HeadOrphaned);
            }
        }

        if let Some(next) = next {
            if !next.extends(head) {
                tracing::warn!(
                    at = head.number,
                    local = %head.hash,
                    next_parent = %next.parent_hash,
                    reorg_type = %ReorgType::ParentMismatch,
                    "Reorg detected"
                );
                return ForkCheck::Fork(ReorgType::ParentMismatch);
            }
        }

        ForkCheck::Canonical
    }

    /// Returns `true` if reverting `depth` blocks would exceed the configured bound.
    pub fn exceeds(&self, depth: u64) -> bool {
        depth > self.max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(num: u64, hash: &str, parent: &str) -> BlockSummary {
        BlockSummary {
            number: num,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (num * 2) as i64,
            tx_count: 0,
        }
    }

    #[test]
    fn genesis_when_nothing_indexed() {
        let det = ReorgDetector::new(100);
        assert_eq!(det.check(None, None, None), ForkCheck::Genesis);
    }

    #[test]
    fn no_reorg_on_normal_chain() {
        let det = ReorgDetector::new(100);
        let head = b(100, "0xa", "0x99");
        let next = b(101, "0xb", "0xa");
        assert_eq!(
            det.check(Some(&head), Some(&head), Some(&next)),
            ForkCheck::Canonical
        );
    }

    #[test]
    fn detects_orphaned_head() {
        let det = ReorgDetector::new(100);
        let head = b(100, "0xa", "0x99");
        let canonical = b(100, "0xa2", "0x99");
        assert_eq!(
            det.check(Some(&head), Some(&canonical), None),
            ForkCheck::Fork(ReorgType::HeadOrphaned)
        );
    }

    #[test]
    fn detects_parent_mismatch() {
        let det = ReorgDetector::new(100);
        let head = b(100, "0xa", "0x99");
        let next = b(101, "0xc", "0xb");
        assert_eq!(
            det.check(Some(&head), None, Some(&next)),
            ForkCheck::Fork(ReorgType::ParentMismatch)
        );
    }

    #[test]
    fn lagging_source_is_not_a_fork() {
        let det = ReorgDetector::new(100);
        let head = b(100, "0xa", "0x99");
        assert_eq!(det.check(Some(&head), None, None), ForkCheck::Canonical);
    }

    #[test]
    fn depth_bound() {
        let det = ReorgDetector::new(3);
        assert!(!det.exceeds(3));
        assert!(det.exceeds(4));
    }
}
