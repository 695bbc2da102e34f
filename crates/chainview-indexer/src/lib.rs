//! chainview-indexer — drives the pipeline from a block source.
//!
//! # Architecture
//!
//! ```text
//! BlockSource ──▶ BlockIndexer::index_next ──▶ HandlerRegistry ──▶ entity handlers
//!                      │   (fork check, revert)        │
//!                      │                               └─ TxEffects { writes, events }
//!                      ▼
//!            one SQLite transaction per block (versions, skips, block row, checkpoint)
//!                      │ before commit
//!                      ▼
//!            ChallengeEventQueue::flush ──▶ ChallengeEventBus (same transaction)
//!
//! PeriodicWorker ─(lease)─▶ BlockIndexJob | ChallengeJob
//! ```

pub mod entities;
pub mod handler;
pub mod metadata;
pub mod pass;
pub mod source;
pub mod worker;

pub use handler::{EmittedEvent, EntityHandler, HandlerRegistry, TxContext, TxEffects};
pub use metadata::{MemoryMetadataStore, MetadataResolver};
pub use pass::{BlockIndexer, BlockOutcome, CommittedBlock, PassReport};
pub use source::{BlockSource, MemoryChain};
pub use worker::{BlockIndexJob, ChallengeJob, Job, PeriodicWorker, TickOutcome};
