//! Static challenge definitions loaded from a JSON file.
//!
//! ```json
//! [
//!   {"id": "mobile-install", "type": "boolean", "amount": 1, "event": "mobile_install"},
//!   {"id": "listens-2", "type": "numeric", "amount": 5, "step_count": 1000,
//!    "event": "track_listen", "prerequisite": "listens-1"}
//! ]
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::info;

use chainview_core::challenge::{Challenge, ChallengeEvent, ChallengeType};
use chainview_core::error::IndexerError;
use chainview_storage::challenges;

use crate::updater::ChallengeUpdater;
use crate::updaters::{
    AggregateUpdater, BooleanUpdater, MilestoneUpdater, NumericUpdater, PerTrackUpdater, ProfileCompletionUpdater,
    TrendingUpdater,
};

/// The definitions bundled with the crate.
pub const DEFAULT_DEFINITIONS: &str = include_str!("../definitions/challenges.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdaterKind {
    Boolean,
    Numeric,
    Milestone,
    Aggregate,
    Trending,
    /// Seven profile steps read from live state.
    Profile,
    /// One instance per track across all users.
    Track,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub amount: u64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub step_count: Option<u32>,
    #[serde(default)]
    pub starting_block: Option<u64>,
    /// Event the challenge listens to.
    pub event: ChallengeEvent,
    /// Further events that re-evaluate the same challenge.
    #[serde(default)]
    pub also_on: Vec<ChallengeEvent>,
    /// Updater override. Derived from `type` and `prerequisite` when absent.
    #[serde(default)]
    pub updater: Option<UpdaterKind>,
    /// Challenge that must be complete for the same specifier first.
    #[serde(default)]
    pub prerequisite: Option<String>,
    /// `extra` field scoping aggregate, trending and per-track instances.
    #[serde(default)]
    pub specifier_field: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ChallengeDefinition {
    pub fn to_challenge(&self) -> Challenge {
        Challenge {
            id: self.id.clone(),
            challenge_type: self.challenge_type,
            amount: self.amount,
            active: self.active,
            step_count: self.step_count,
            starting_block: self.starting_block,
        }
    }

    pub fn updater_kind(&self) -> UpdaterKind {
        if let Some(kind) = self.updater {
            return kind;
        }
        match (self.challenge_type, &self.prerequisite) {
            (ChallengeType::Boolean, _) => UpdaterKind::Boolean,
            (ChallengeType::Numeric, Some(_)) => UpdaterKind::Milestone,
            (ChallengeType::Numeric, None) => UpdaterKind::Numeric,
            (ChallengeType::Aggregate, _) => UpdaterKind::Aggregate,
            (ChallengeType::Trending, _) => UpdaterKind::Trending,
        }
    }

    pub fn build_updater(&self) -> Arc<dyn ChallengeUpdater> {
        match self.updater_kind() {
            UpdaterKind::Boolean => Arc::new(BooleanUpdater),
            UpdaterKind::Numeric => Arc::new(NumericUpdater),
            UpdaterKind::Milestone => Arc::new(MilestoneUpdater::new(
                self.prerequisite.clone().unwrap_or_default(),
            )),
            UpdaterKind::Aggregate => Arc::new(AggregateUpdater::new(
                self.specifier_field.as_deref().unwrap_or("referred_user_id"),
            )),
            UpdaterKind::Trending => Arc::new(TrendingUpdater::new(
                self.specifier_field.as_deref().unwrap_or("week"),
            )),
            UpdaterKind::Profile => Arc::new(ProfileCompletionUpdater),
            UpdaterKind::Track => Arc::new(PerTrackUpdater::new(
                self.id.clone(),
                self.specifier_field.as_deref().unwrap_or("track_id"),
            )),
        }
    }

    /// Every event this challenge listens to, primary first.
    pub fn events(&self) -> impl Iterator<Item = ChallengeEvent> + '_ {
        std::iter::once(self.event).chain(self.also_on.iter().copied().filter(move |e| *e != self.event))
    }

    fn validate(&self) -> Result<(), IndexerError> {
        let needs_steps = matches!(self.challenge_type, ChallengeType::Numeric | ChallengeType::Aggregate)
            || self.updater_kind() == UpdaterKind::Profile;
        if needs_steps && self.step_count.unwrap_or(0) == 0 {
            return Err(IndexerError::Config(format!(
                "challenge '{}' of type {} needs step_count > 0",
                self.id, self.challenge_type
            )));
        }
        if self.updater_kind() == UpdaterKind::Milestone && self.prerequisite.is_none() {
            return Err(IndexerError::Config(format!(
                "milestone challenge '{}' needs a prerequisite",
                self.id
            )));
        }
        Ok(())
    }
}

/// Parse and validate a definitions document.
pub fn parse_definitions(raw: &str) -> Result<Vec<ChallengeDefinition>, IndexerError> {
    let defs: Vec<ChallengeDefinition> =
        serde_json::from_str(raw).map_err(|e| IndexerError::Config(format!("challenge definitions: {e}")))?;
    for def in &defs {
        def.validate()?;
    }
    Ok(defs)
}

pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<ChallengeDefinition>, IndexerError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
    parse_definitions(&raw)
}

pub fn default_definitions() -> Result<Vec<ChallengeDefinition>, IndexerError> {
    parse_definitions(DEFAULT_DEFINITIONS)
}

/// Upsert every definition into the `challenges` table.
pub async fn seed_challenges(
    conn: &mut SqliteConnection,
    definitions: &[ChallengeDefinition],
) -> Result<usize, IndexerError> {
    for def in definitions {
        challenges::upsert_challenge(conn, &def.to_challenge()).await?;
    }
    info!(count = definitions.len(), "challenges seeded");
    Ok(definitions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainview_storage::SqliteStorage;

    #[test]
    fn bundled_definitions_parse() {
        let defs = default_definitions().unwrap();
        assert!(defs.iter().any(|d| d.id == "mobile-install"));
        assert!(defs.iter().any(|d| d.updater_kind() == UpdaterKind::Milestone));
    }

    #[test]
    fn updater_kind_derivation() {
        let defs = parse_definitions(
            r#"[
                {"id": "a", "type": "numeric", "amount": 1, "step_count": 3, "event": "track_upload"},
                {"id": "b", "type": "numeric", "amount": 1, "step_count": 3, "event": "track_upload", "prerequisite": "a"},
                {"id": "c", "type": "aggregate", "amount": 1, "step_count": 5, "event": "referral_signup"}
            ]"#,
        )
        .unwrap();
        assert_eq!(defs[0].updater_kind(), UpdaterKind::Numeric);
        assert_eq!(defs[1].updater_kind(), UpdaterKind::Milestone);
        assert_eq!(defs[2].updater_kind(), UpdaterKind::Aggregate);
        assert!(defs[0].active);
    }

    #[test]
    fn profile_completion_listens_to_social_events() {
        let defs = default_definitions().unwrap();
        let profile = defs.iter().find(|d| d.id == "profile-completion").unwrap();
        assert_eq!(profile.updater_kind(), UpdaterKind::Profile);
        assert_eq!(profile.step_count, Some(7));
        assert_eq!(
            profile.events().collect::<Vec<_>>(),
            [
                ChallengeEvent::ProfileUpdate,
                ChallengeEvent::Follow,
                ChallengeEvent::Repost,
                ChallengeEvent::Favorite
            ]
        );
        assert_eq!(profile.build_updater().kind(), "profile");

        let cosign = defs.iter().find(|d| d.id == "remix-cosign").unwrap();
        assert_eq!(cosign.build_updater().kind(), "track");
    }

    #[test]
    fn numeric_without_steps_rejected() {
        let err = parse_definitions(r#"[{"id": "a", "type": "numeric", "amount": 1, "event": "track_upload"}]"#)
            .unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let defs = default_definitions().unwrap();

        seed_challenges(&mut conn, &defs).await.unwrap();
        seed_challenges(&mut conn, &defs).await.unwrap();
        assert_eq!(challenges::all_challenges(&mut conn).await.unwrap().len(), defs.len());
    }
}
