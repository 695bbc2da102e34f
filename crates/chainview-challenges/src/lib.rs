//! chainview-challenges — turns indexed domain events into challenge progress
//! and exactly-once disbursement eligibility.
//!
//! # Architecture
//!
//! ```text
//! block pass ── ChallengeEventQueue ──(block tx)──▶ ChallengeEventBus::dispatch
//!                                                          │  challenge_events log
//!                                                          ▼
//!                        ChallengeEventBus::process_events ─▶ ChallengeRegistry
//!                                                               └─ ChallengeManager ─▶ ChallengeUpdater
//!                                                                                          │
//!                                         DisbursementLedger ◀── user_challenges ◀─────────┘
//! ```

pub mod bus;
pub mod definitions;
pub mod disbursement;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod summary;
pub mod updater;
pub mod updaters;

pub use bus::{ChallengeEventBus, ProcessSummary};
pub use definitions::{load_definitions, seed_challenges, ChallengeDefinition, UpdaterKind};
pub use disbursement::DisbursementLedger;
pub use manager::ChallengeManager;
pub use queue::{ChallengeEventQueue, QueuedEvent};
pub use registry::ChallengeRegistry;
pub use summary::{challenge_summaries, ChallengeSummary};
pub use updater::ChallengeUpdater;
pub use updaters::{
    AggregateUpdater, BooleanUpdater, MilestoneUpdater, NumericUpdater, PerTrackUpdater, ProfileCompletionUpdater,
    TrendingUpdater,
};
