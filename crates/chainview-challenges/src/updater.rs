//! The capability set every challenge plugs into the bus through.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use chainview_core::challenge::{ChallengeEvent, EventMetadata, UserChallenge};
use chainview_core::error::IndexerError;

/// Per-challenge update logic.
///
/// Implementations decide how events map to challenge instances and how those
/// instances progress. Everything else (loading the challenge, the
/// `starting_block` gate, instance creation, aggregate caps, persistence) is
/// done by [`ChallengeManager`](crate::manager::ChallengeManager).
#[async_trait]
pub trait ChallengeUpdater: Send + Sync {
    /// Short name used in logs and summaries (e.g. `"boolean"`).
    fn kind(&self) -> &'static str;

    /// The key scoping one instance of the challenge. Defaults to the user id.
    fn generate_specifier(&self, user_id: u64, _extra: &serde_json::Value) -> String {
        user_id.to_string()
    }

    /// Whether an event with no existing instance should create one.
    async fn should_create_new_challenge(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        _user_id: u64,
        _extra: &serde_json::Value,
    ) -> Result<bool, IndexerError> {
        Ok(true)
    }

    /// Whether the challenge is visible to `user_id` at all.
    async fn should_show_challenge_for_user(
        &self,
        _conn: &mut SqliteConnection,
        _user_id: u64,
    ) -> Result<bool, IndexerError> {
        Ok(true)
    }

    /// Advance `user_challenges` given this batch's events for them.
    ///
    /// `event_metadatas` is ordered by block number. Instances are persisted by
    /// the caller afterwards.
    async fn update_user_challenges(
        &self,
        conn: &mut SqliteConnection,
        event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        starting_block: Option<u64>,
    ) -> Result<(), IndexerError>;

    /// Hook run after new instances were created for `metadatas`.
    async fn on_after_challenge_creation(
        &self,
        _conn: &mut SqliteConnection,
        _metadatas: &[EventMetadata],
    ) -> Result<(), IndexerError> {
        Ok(())
    }
}
