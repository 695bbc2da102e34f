//! Error types for the chainview pipeline.

use thiserror::Error;

/// Errors that can occur during indexing and challenge processing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Block source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Reorg detected at block {block_number}: expected hash {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Checkpoint mismatch on '{stream}': stored {stored}, attempted {attempted}")]
    CheckpointMismatch {
        stream: String,
        stored: u64,
        attempted: u64,
    },

    #[error("Transient failure in tx {tx_hash} at block {block_number}: {reason}")]
    Transient {
        block_number: u64,
        tx_hash: String,
        reason: String,
    },

    #[error("Challenge '{challenge_id}' already disbursed for specifier '{specifier}'")]
    AlreadyDisbursed {
        challenge_id: String,
        specifier: String,
    },

    #[error("Challenge '{challenge_id}' is not complete for specifier '{specifier}'")]
    NotComplete {
        challenge_id: String,
        specifier: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` if the next scheduled pass may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Source(_) | Self::Storage(_) | Self::Transient { .. } | Self::ReorgDetected { .. }
        )
    }
}

/// Outcome of validating and applying a single chain transaction.
///
/// `Invalid` is a network-level skip: the decision is a pure function of
/// on-chain data, so every indexer reaches it. `Transient` is a node-level
/// failure of an auxiliary collaborator. `Fatal` aborts the whole block.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid transaction: {0}")]
    Invalid(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Fatal(#[from] IndexerError),
}

impl TxError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(IndexerError::Storage("locked".into()).is_retryable());
        assert!(IndexerError::Transient {
            block_number: 1,
            tx_hash: "0x1".into(),
            reason: "timeout".into(),
        }
        .is_retryable());
        assert!(!IndexerError::AlreadyDisbursed {
            challenge_id: "c".into(),
            specifier: "1".into(),
        }
        .is_retryable());
    }

    #[test]
    fn storage_error_converts_to_fatal() {
        let err: TxError = IndexerError::Storage("disk full".into()).into();
        assert!(matches!(err, TxError::Fatal(IndexerError::Storage(_))));
    }
}
