//! chainview-core — foundation for the reorg-safe entity indexer and the
//! challenge reward pipeline.
//!
//! # Architecture
//!
//! ```text
//! IndexerBuilder → BlockIndexer
//!                      ├── TransactionSorter (hash order, then chain index order)
//!                      ├── ReorgDetector     (orphaned head / parent mismatch)
//!                      ├── Entity handlers   (ManageEntity → EntityWrite + events)
//!                      ├── Checkpoints       (one stream per pipeline)
//!                      └── Lease             (one worker per job name)
//! ```

pub mod builder;
pub mod challenge;
pub mod checkpoint;
pub mod config;
pub mod entity;
pub mod error;
pub mod lease;
pub mod reorg;
pub mod sorter;
pub mod types;

pub use builder::IndexerBuilder;
pub use challenge::{
    Challenge, ChallengeDisbursement, ChallengeEvent, ChallengeEventRecord, ChallengeType,
    EventMetadata, UserChallenge,
};
pub use checkpoint::{Checkpoint, CHALLENGE_EVENTS_STREAM, ENTITY_MANAGER_STREAM};
pub use config::{IndexerConfig, IndexerState};
pub use entity::{Action, EntityType, EntityVersion, EntityWrite, ManageEntity};
pub use error::{IndexerError, TxError};
pub use lease::{Lease, MemoryLease};
pub use reorg::{ForkCheck, ReorgDetector, ReorgEvent, ReorgType};
pub use sorter::TransactionSorter;
pub use types::{BlockRef, BlockSummary, ChainBlock, ChainTransaction, IndexedBlock};
