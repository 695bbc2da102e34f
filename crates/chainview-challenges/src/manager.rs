//! Challenge manager: applies a batch of one event type to one challenge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::SqliteConnection;
use tracing::debug;

use chainview_core::challenge::{
    Challenge, ChallengeEvent, ChallengeEventRecord, ChallengeType, EventMetadata, UserChallenge,
};
use chainview_core::error::IndexerError;
use chainview_storage::challenges;

use crate::updater::ChallengeUpdater;

/// Binds a challenge id to its updater.
#[derive(Clone)]
pub struct ChallengeManager {
    challenge_id: String,
    updater: Arc<dyn ChallengeUpdater>,
}

impl std::fmt::Debug for ChallengeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeManager")
            .field("challenge_id", &self.challenge_id)
            .finish_non_exhaustive()
    }
}

impl ChallengeManager {
    pub fn new(challenge_id: impl Into<String>, updater: Arc<dyn ChallengeUpdater>) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            updater,
        }
    }

    pub fn challenge_id(&self) -> &str {
        &self.challenge_id
    }

    pub fn updater(&self) -> &Arc<dyn ChallengeUpdater> {
        &self.updater
    }

    /// Apply `events` (all of type `event`, ordered by block) to this challenge.
    ///
    /// Returns the number of instances created or updated.
    pub async fn process(
        &self,
        conn: &mut SqliteConnection,
        event: ChallengeEvent,
        events: &[ChallengeEventRecord],
    ) -> Result<usize, IndexerError> {
        let Some(challenge) = challenges::get_challenge(conn, &self.challenge_id).await? else {
            debug!(challenge = %self.challenge_id, "challenge not seeded, ignoring events");
            return Ok(0);
        };
        if !challenge.active {
            debug!(challenge = %challenge.id, "challenge inactive, ignoring events");
            return Ok(0);
        }

        let metadatas: Vec<EventMetadata> = events
            .iter()
            .filter(|e| challenge.accepts_block(e.block_number))
            .map(|e| EventMetadata {
                block_number: e.block_number,
                user_id: e.user_id,
                extra: e.extra.clone(),
                specifier: self.updater.generate_specifier(e.user_id, &e.extra),
            })
            .collect();
        if metadatas.is_empty() {
            return Ok(0);
        }

        let mut specifiers: Vec<String> = Vec::new();
        for m in &metadatas {
            if !specifiers.contains(&m.specifier) {
                specifiers.push(m.specifier.clone());
            }
        }
        let mut instances =
            challenges::user_challenges_for(conn, &challenge.id, &specifiers).await?;
        let existing: HashSet<String> = instances.iter().map(|uc| uc.specifier.clone()).collect();

        let created = self
            .create_instances(conn, &challenge, event, &metadatas, &existing)
            .await?;
        if !created.is_empty() {
            let created_metadatas: Vec<EventMetadata> = metadatas
                .iter()
                .filter(|m| created.iter().any(|uc| uc.specifier == m.specifier))
                .cloned()
                .collect();
            self.updater
                .on_after_challenge_creation(conn, &created_metadatas)
                .await?;
        }
        let created_count = created.len();
        instances.extend(created);

        // Instances were capped away: drop their events so updaters never see
        // a specifier without an instance.
        let live: HashSet<&str> = instances.iter().map(|uc| uc.specifier.as_str()).collect();
        let metadatas: Vec<EventMetadata> = metadatas
            .iter()
            .filter(|m| live.contains(m.specifier.as_str()))
            .cloned()
            .collect();

        self.updater
            .update_user_challenges(
                conn,
                event,
                &mut instances,
                challenge.step_count,
                &metadatas,
                challenge.starting_block,
            )
            .await?;

        for uc in &instances {
            challenges::save_user_challenge(conn, uc).await?;
        }

        debug!(
            challenge = %challenge.id,
            event = %event,
            created = created_count,
            touched = instances.len(),
            "challenge processed"
        );
        Ok(instances.len())
    }

    async fn create_instances(
        &self,
        conn: &mut SqliteConnection,
        challenge: &Challenge,
        event: ChallengeEvent,
        metadatas: &[EventMetadata],
        existing: &HashSet<String>,
    ) -> Result<Vec<UserChallenge>, IndexerError> {
        let mut created: Vec<UserChallenge> = Vec::new();
        // Aggregate challenges: amount already granted per user.
        let mut granted: HashMap<u64, u64> = HashMap::new();

        for m in metadatas {
            if existing.contains(&m.specifier) || created.iter().any(|uc| uc.specifier == m.specifier) {
                continue;
            }
            if !self
                .updater
                .should_create_new_challenge(conn, event, m.user_id, &m.extra)
                .await?
            {
                continue;
            }

            let mut amount = challenge.amount;
            if challenge.challenge_type == ChallengeType::Aggregate {
                amount = m.extra_u64("amount").unwrap_or(challenge.amount);
                let cap = u64::from(challenge.step_count.unwrap_or(u32::MAX));
                let used = match granted.get(&m.user_id) {
                    Some(used) => *used,
                    None => challenges::user_instances(conn, &challenge.id, m.user_id)
                        .await?
                        .iter()
                        .map(|uc| uc.amount)
                        .sum(),
                };
                let Some(total) = used.checked_add(amount).filter(|t| *t <= cap) else {
                    debug!(
                        challenge = %challenge.id,
                        user_id = m.user_id,
                        used,
                        cap,
                        "aggregate cap reached"
                    );
                    granted.insert(m.user_id, used);
                    continue;
                };
                granted.insert(m.user_id, total);
            }

            created.push(UserChallenge::new(challenge, m.specifier.clone(), m.user_id, amount));
        }
        Ok(created)
    }
}
