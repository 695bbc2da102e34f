//! Updater implementations for the challenge shapes the bus ships with.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use chainview_core::challenge::{ChallengeEvent, EventMetadata, UserChallenge};
use chainview_core::entity::EntityType;
use chainview_core::error::IndexerError;
use chainview_storage::{challenges, versions};

use crate::updater::ChallengeUpdater;

/// Block of the first event for `specifier` in the batch.
fn first_block_for(specifier: &str, metadatas: &[EventMetadata]) -> Option<u64> {
    metadatas
        .iter()
        .filter(|m| m.specifier == specifier)
        .map(|m| m.block_number)
        .min()
}

/// Apply one step per event to `uc`. Returns the block at which `step_count`
/// was reached, if it was.
fn add_steps(uc: &mut UserChallenge, step_count: u32, metadatas: &[EventMetadata]) -> Option<u64> {
    let mut steps = uc.current_step_count.unwrap_or(0);
    let mut reached = None;
    for m in metadatas.iter().filter(|m| m.specifier == uc.specifier) {
        if steps >= step_count {
            break;
        }
        steps += 1;
        if steps >= step_count {
            reached = Some(m.block_number);
        }
    }
    uc.current_step_count = Some(steps);
    reached
}

fn extra_field(extra: &serde_json::Value, field: &str) -> Option<String> {
    match extra.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

// ─── Boolean ──────────────────────────────────────────────────────────────────

/// Completes on the first qualifying event.
#[derive(Debug, Default)]
pub struct BooleanUpdater;

#[async_trait]
impl ChallengeUpdater for BooleanUpdater {
    fn kind(&self) -> &'static str {
        "boolean"
    }

    async fn update_user_challenges(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        _step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            if let Some(block) = first_block_for(&uc.specifier, event_metadatas) {
                uc.complete(block);
            }
        }
        Ok(())
    }
}

// ─── Numeric ──────────────────────────────────────────────────────────────────

/// One step per event until `step_count` is reached.
#[derive(Debug, Default)]
pub struct NumericUpdater;

#[async_trait]
impl ChallengeUpdater for NumericUpdater {
    fn kind(&self) -> &'static str {
        "numeric"
    }

    async fn update_user_challenges(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        let step_count = step_count.unwrap_or(1);
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            if let Some(block) = add_steps(uc, step_count, event_metadatas) {
                uc.complete(block);
            }
        }
        Ok(())
    }
}

// ─── Milestone ────────────────────────────────────────────────────────────────

/// A numeric tier that may only complete once the previous tier has completed
/// for the same specifier. Hidden until then.
#[derive(Debug)]
pub struct MilestoneUpdater {
    prerequisite: String,
}

impl MilestoneUpdater {
    pub fn new(prerequisite: impl Into<String>) -> Self {
        Self {
            prerequisite: prerequisite.into(),
        }
    }

    pub fn prerequisite(&self) -> &str {
        &self.prerequisite
    }

    async fn prerequisite_complete(&self, conn: &mut SqliteConnection, specifier: &str) -> Result<bool, IndexerError> {
        Ok(challenges::get_user_challenge(conn, &self.prerequisite, specifier)
            .await?
            .map_or(false, |uc| uc.is_complete))
    }
}

#[async_trait]
impl ChallengeUpdater for MilestoneUpdater {
    fn kind(&self) -> &'static str {
        "milestone"
    }

    async fn should_show_challenge_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: u64,
    ) -> Result<bool, IndexerError> {
        self.prerequisite_complete(conn, &user_id.to_string()).await
    }

    async fn update_user_challenges(
        &self,
        conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        let step_count = step_count.unwrap_or(1);
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            let reached = add_steps(uc, step_count, event_metadatas);
            if uc.current_step_count.unwrap_or(0) < step_count {
                continue;
            }
            if !self.prerequisite_complete(conn, &uc.specifier).await? {
                tracing::debug!(
                    challenge = %uc.challenge_id,
                    specifier = %uc.specifier,
                    prerequisite = %self.prerequisite,
                    "milestone reached before prerequisite, completion deferred"
                );
                continue;
            }
            let block = reached
                .or_else(|| first_block_for(&uc.specifier, event_metadatas))
                .unwrap_or(0);
            uc.complete(block);
        }
        Ok(())
    }
}

// ─── Aggregate ────────────────────────────────────────────────────────────────

/// Many instances per user, scoped by `{user}:{extra[field]}`, each complete
/// at creation. The manager caps the total amount at `step_count`.
#[derive(Debug)]
pub struct AggregateUpdater {
    field: String,
}

impl AggregateUpdater {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

#[async_trait]
impl ChallengeUpdater for AggregateUpdater {
    fn kind(&self) -> &'static str {
        "aggregate"
    }

    fn generate_specifier(&self, user_id: u64, extra: &serde_json::Value) -> String {
        format!("{user_id}:{}", extra_field(extra, &self.field).unwrap_or_default())
    }

    async fn should_create_new_challenge(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        _user_id: u64,
        extra: &serde_json::Value,
    ) -> Result<bool, IndexerError> {
        Ok(extra_field(extra, &self.field).is_some())
    }

    async fn update_user_challenges(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        _step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            if let Some(block) = first_block_for(&uc.specifier, event_metadatas) {
                uc.complete(block);
            }
        }
        Ok(())
    }
}

// ─── Trending ─────────────────────────────────────────────────────────────────

/// Instances scoped by a period field (`{extra[field]}:{user}`), complete at
/// creation and uncapped.
#[derive(Debug)]
pub struct TrendingUpdater {
    field: String,
}

impl TrendingUpdater {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

#[async_trait]
impl ChallengeUpdater for TrendingUpdater {
    fn kind(&self) -> &'static str {
        "trending"
    }

    fn generate_specifier(&self, user_id: u64, extra: &serde_json::Value) -> String {
        format!("{}:{user_id}", extra_field(extra, &self.field).unwrap_or_default())
    }

    async fn should_create_new_challenge(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        _user_id: u64,
        extra: &serde_json::Value,
    ) -> Result<bool, IndexerError> {
        Ok(extra_field(extra, &self.field).is_some())
    }

    async fn update_user_challenges(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        _step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            if let Some(block) = first_block_for(&uc.specifier, event_metadatas) {
                uc.complete(block);
            }
        }
        Ok(())
    }
}

// ─── Per track ────────────────────────────────────────────────────────────────

/// One instance per piece of content, whoever triggers it. The specifier is
/// `extra[field]` (a track id), and an instance already stored for that track
/// blocks any new one, including from a different user. Complete at creation.
#[derive(Debug)]
pub struct PerTrackUpdater {
    challenge_id: String,
    field: String,
}

impl PerTrackUpdater {
    pub fn new(challenge_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            field: field.into(),
        }
    }
}

#[async_trait]
impl ChallengeUpdater for PerTrackUpdater {
    fn kind(&self) -> &'static str {
        "track"
    }

    fn generate_specifier(&self, _user_id: u64, extra: &serde_json::Value) -> String {
        extra_field(extra, &self.field).unwrap_or_default()
    }

    async fn should_create_new_challenge(
        &self,
        conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        _user_id: u64,
        extra: &serde_json::Value,
    ) -> Result<bool, IndexerError> {
        let Some(track) = extra_field(extra, &self.field) else {
            return Ok(false);
        };
        Ok(challenges::get_user_challenge(conn, &self.challenge_id, &track)
            .await?
            .is_none())
    }

    async fn update_user_challenges(
        &self,
        _conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        _step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            if let Some(block) = first_block_for(&uc.specifier, event_metadatas) {
                uc.complete(block);
            }
        }
        Ok(())
    }
}

// ─── Profile completion ───────────────────────────────────────────────────────

/// Minimum follows for the follow step.
pub const PROFILE_MIN_FOLLOWS: u64 = 5;

/// Profile fields that each count as a step; any alias being set is enough.
const PROFILE_FIELDS: [&[&str]; 4] = [
    &["name"],
    &["profile_picture", "profile_picture_sizes"],
    &["cover_photo", "cover_photo_sizes"],
    &["bio"],
];

/// Seven steps read from the user's current state rather than counted from
/// events: name, profile picture, cover photo, bio, at least one repost, at
/// least one save, and five follows. Undoing a field lowers the count until
/// the challenge completes; after that it is frozen.
#[derive(Debug, Default)]
pub struct ProfileCompletionUpdater;

impl ProfileCompletionUpdater {
    /// Steps `user_id` has satisfied right now.
    pub async fn steps_done(&self, conn: &mut SqliteConnection, user_id: u64) -> Result<u32, IndexerError> {
        let mut steps = 0;
        if let Some(user) = versions::live(conn, EntityType::User, &user_id.to_string()).await? {
            let present = |names: &[&str]| {
                names.iter().any(|n| match user.fields.get(*n) {
                    Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
                    Some(serde_json::Value::Null) | None => false,
                    Some(_) => true,
                })
            };
            for names in PROFILE_FIELDS {
                if present(names) {
                    steps += 1;
                }
            }
        }

        let prefix = format!("{user_id}:");
        if versions::live_count_by_prefix(conn, EntityType::Repost, &prefix).await? > 0 {
            steps += 1;
        }
        if versions::live_count_by_prefix(conn, EntityType::Save, &prefix).await? > 0 {
            steps += 1;
        }
        if versions::live_count_by_prefix(conn, EntityType::Follow, &prefix).await? >= PROFILE_MIN_FOLLOWS {
            steps += 1;
        }
        Ok(steps)
    }
}

#[async_trait]
impl ChallengeUpdater for ProfileCompletionUpdater {
    fn kind(&self) -> &'static str {
        "profile"
    }

    async fn update_user_challenges(
        &self,
        conn: &mut SqliteConnection,
        _event: ChallengeEvent,
        user_challenges: &mut [UserChallenge],
        step_count: Option<u32>,
        event_metadatas: &[EventMetadata],
        _starting_block: Option<u64>,
    ) -> Result<(), IndexerError> {
        let step_count = step_count.unwrap_or(7);
        for uc in user_challenges.iter_mut().filter(|uc| !uc.is_complete) {
            let steps = self.steps_done(conn, uc.user_id).await?.min(step_count);
            uc.current_step_count = Some(steps);
            if steps >= step_count {
                let block = event_metadatas
                    .iter()
                    .filter(|m| m.specifier == uc.specifier)
                    .map(|m| m.block_number)
                    .max()
                    .unwrap_or(0);
                uc.complete(block);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainview_core::challenge::{Challenge, ChallengeType};
    use chainview_core::entity::EntityWrite;
    use chainview_core::types::BlockRef;
    use chainview_storage::SqliteStorage;
    use serde_json::json;

    fn challenge(id: &str, kind: ChallengeType, step_count: Option<u32>) -> Challenge {
        Challenge {
            id: id.into(),
            challenge_type: kind,
            amount: 1,
            active: true,
            step_count,
            starting_block: None,
        }
    }

    fn meta(block: u64, user: u64) -> EventMetadata {
        EventMetadata {
            block_number: block,
            user_id: user,
            extra: json!({}),
            specifier: user.to_string(),
        }
    }

    #[tokio::test]
    async fn boolean_completes_at_first_event() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let c = challenge("m", ChallengeType::Boolean, None);
        let mut ucs = vec![UserChallenge::new(&c, "7", 7, 1)];

        BooleanUpdater
            .update_user_challenges(&mut conn, ChallengeEvent::MobileInstall, &mut ucs, None, &[meta(12, 7), meta(9, 7)], None)
            .await
            .unwrap();
        assert!(ucs[0].is_complete);
        assert_eq!(ucs[0].completed_blocknumber, Some(9));
    }

    #[tokio::test]
    async fn numeric_counts_every_event() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let c = challenge("u", ChallengeType::Numeric, Some(3));
        let mut ucs = vec![UserChallenge::new(&c, "7", 7, 1)];

        NumericUpdater
            .update_user_challenges(&mut conn, ChallengeEvent::TrackUpload, &mut ucs, Some(3), &[meta(1, 7), meta(2, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(2));
        assert!(!ucs[0].is_complete);

        NumericUpdater
            .update_user_challenges(&mut conn, ChallengeEvent::TrackUpload, &mut ucs, Some(3), &[meta(5, 7), meta(6, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(3));
        assert_eq!(ucs[0].completed_blocknumber, Some(5));
    }

    #[tokio::test]
    async fn milestone_waits_for_prerequisite() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let p1 = challenge("p1", ChallengeType::Numeric, Some(1));
        let p2 = challenge("p2", ChallengeType::Numeric, Some(1));
        let updater = MilestoneUpdater::new("p1");

        let mut ucs = vec![UserChallenge::new(&p2, "7", 7, 1)];
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::TrackListen, &mut ucs, Some(1), &[meta(3, 7)], None)
            .await
            .unwrap();
        assert!(!ucs[0].is_complete);
        assert_eq!(ucs[0].current_step_count, Some(1));
        assert!(!updater.should_show_challenge_for_user(&mut conn, 7).await.unwrap());

        let mut done = UserChallenge::new(&p1, "7", 7, 1);
        done.complete(3);
        challenges::save_user_challenge(&mut conn, &done).await.unwrap();

        updater
            .update_user_challenges(&mut conn, ChallengeEvent::TrackListen, &mut ucs, Some(1), &[meta(4, 7)], None)
            .await
            .unwrap();
        assert!(ucs[0].is_complete);
        assert_eq!(ucs[0].completed_blocknumber, Some(4));
        assert!(updater.should_show_challenge_for_user(&mut conn, 7).await.unwrap());
    }

    async fn write(conn: &mut SqliteConnection, w: EntityWrite, block: u64) {
        let at = BlockRef {
            blockhash: format!("0x{block:x}"),
            blocknumber: block,
            slot: None,
        };
        versions::apply_transaction(conn, &w, &at, &format!("0xt{block}")).await.unwrap();
    }

    #[tokio::test]
    async fn profile_steps_follow_live_state() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let c = challenge("profile-completion", ChallengeType::Numeric, Some(7));
        let mut ucs = vec![UserChallenge::new(&c, "7", 7, 1)];
        let updater = ProfileCompletionUpdater;

        write(&mut conn, EntityWrite::upsert(EntityType::User, "7", json!({"name": "ann", "bio": ""})), 1).await;
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::ProfileUpdate, &mut ucs, Some(7), &[meta(1, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(1));
        assert!(!ucs[0].is_complete);

        for f in 1..=5 {
            write(&mut conn, EntityWrite::upsert(EntityType::Follow, format!("7:{f}"), json!({})), 2).await;
        }
        write(&mut conn, EntityWrite::upsert(EntityType::Repost, "7:Track:1", json!({})), 2).await;
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::Follow, &mut ucs, Some(7), &[meta(2, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(3));

        // Unfollowing drops below the threshold again.
        write(&mut conn, EntityWrite::delete(EntityType::Follow, "7:5", json!({})), 3).await;
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::Follow, &mut ucs, Some(7), &[meta(3, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(2));

        write(&mut conn, EntityWrite::upsert(EntityType::Follow, "7:6", json!({})), 4).await;
        write(&mut conn, EntityWrite::upsert(EntityType::Save, "7:Track:1", json!({})), 4).await;
        write(
            &mut conn,
            EntityWrite::upsert(
                EntityType::User,
                "7",
                json!({"name": "ann", "bio": "hi", "profile_picture": "Qm1", "cover_photo_sizes": "Qm2"}),
            ),
            5,
        )
        .await;
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::ProfileUpdate, &mut ucs, Some(7), &[meta(5, 7)], None)
            .await
            .unwrap();
        assert_eq!(ucs[0].current_step_count, Some(7));
        assert!(ucs[0].is_complete);
        assert_eq!(ucs[0].completed_blocknumber, Some(5));

        // Complete stays complete.
        write(&mut conn, EntityWrite::upsert(EntityType::User, "7", json!({"name": "ann"})), 6).await;
        updater
            .update_user_challenges(&mut conn, ChallengeEvent::ProfileUpdate, &mut ucs, Some(7), &[meta(6, 7)], None)
            .await
            .unwrap();
        assert!(ucs[0].is_complete);
        assert_eq!(ucs[0].current_step_count, Some(7));
    }

    #[tokio::test]
    async fn per_track_needs_track_and_no_stored_instance() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let c = challenge("remix-cosign", ChallengeType::Aggregate, Some(1_000_000));
        let updater = PerTrackUpdater::new("remix-cosign", "track_id");
        let extra = json!({"track_id": 42});

        assert_eq!(updater.generate_specifier(7, &extra), "42");
        assert!(!updater
            .should_create_new_challenge(&mut conn, ChallengeEvent::Cosign, 7, &json!({}))
            .await
            .unwrap());
        assert!(updater
            .should_create_new_challenge(&mut conn, ChallengeEvent::Cosign, 7, &extra)
            .await
            .unwrap());

        let mut uc = UserChallenge::new(&c, "42", 7, 1);
        uc.complete(3);
        challenges::save_user_challenge(&mut conn, &uc).await.unwrap();
        assert!(!updater
            .should_create_new_challenge(&mut conn, ChallengeEvent::Cosign, 9, &extra)
            .await
            .unwrap());
    }

    #[test]
    fn aggregate_and_trending_specifiers() {
        let agg = AggregateUpdater::new("referred_user_id");
        assert_eq!(agg.generate_specifier(7, &json!({"referred_user_id": 9})), "7:9");
        let trending = TrendingUpdater::new("week");
        assert_eq!(trending.generate_specifier(7, &json!({"week": "2024-01-01"})), "2024-01-01:7");
        assert_eq!(BooleanUpdater.generate_specifier(7, &json!(null)), "7");
    }
}
