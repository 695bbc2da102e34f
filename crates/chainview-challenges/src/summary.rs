//! Per-user challenge progress, as shown to the user.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use chainview_core::challenge::ChallengeType;
use chainview_core::error::IndexerError;
use chainview_storage::challenges;

use crate::registry::ChallengeRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub challenge_id: String,
    pub challenge_type: ChallengeType,
    pub user_id: u64,
    /// Specifier of the instance (per-user challenges only).
    pub specifier: Option<String>,
    pub is_complete: bool,
    pub current_step_count: u32,
    pub max_steps: Option<u32>,
    /// Reward per instance.
    pub amount: u64,
    /// Total amount already paid out.
    pub disbursed_amount: u64,
}

/// Progress of `user_id` on every active challenge visible to them.
pub async fn challenge_summaries(
    conn: &mut SqliteConnection,
    registry: &ChallengeRegistry,
    user_id: u64,
) -> Result<Vec<ChallengeSummary>, IndexerError> {
    let disbursed = challenges::disbursements_for_user(conn, user_id).await?;
    let mut out = Vec::new();

    for challenge in challenges::all_challenges(conn).await? {
        if !challenge.active {
            continue;
        }
        let Some(manager) = registry.get(&challenge.id) else {
            continue;
        };
        if !manager.updater().should_show_challenge_for_user(conn, user_id).await? {
            continue;
        }

        let instances = challenges::user_instances(conn, &challenge.id, user_id).await?;
        let disbursed_amount = disbursed
            .iter()
            .filter(|d| d.challenge_id == challenge.id)
            .map(|d| d.amount)
            .sum();

        let summary = match challenge.challenge_type {
            ChallengeType::Aggregate | ChallengeType::Trending => {
                let total: u64 = instances.iter().map(|uc| uc.amount).sum();
                let is_complete = match (challenge.challenge_type, challenge.step_count) {
                    (ChallengeType::Aggregate, Some(steps)) => total >= u64::from(steps),
                    _ => !instances.is_empty(),
                };
                let current = match challenge.challenge_type {
                    ChallengeType::Aggregate => total as u32,
                    _ => instances.len() as u32,
                };
                ChallengeSummary {
                    challenge_id: challenge.id.clone(),
                    challenge_type: challenge.challenge_type,
                    user_id,
                    specifier: None,
                    is_complete,
                    current_step_count: current,
                    max_steps: challenge.step_count,
                    amount: challenge.amount,
                    disbursed_amount,
                }
            }
            ChallengeType::Boolean | ChallengeType::Numeric => {
                let specifier = manager
                    .updater()
                    .generate_specifier(user_id, &serde_json::Value::Null);
                let instance = instances.iter().find(|uc| uc.specifier == specifier);
                ChallengeSummary {
                    challenge_id: challenge.id.clone(),
                    challenge_type: challenge.challenge_type,
                    user_id,
                    specifier: Some(specifier.clone()),
                    is_complete: instance.map_or(false, |uc| uc.is_complete),
                    current_step_count: instance
                        .map(|uc| match (uc.current_step_count, uc.is_complete) {
                            (Some(steps), _) => steps,
                            (None, true) => 1,
                            (None, false) => 0,
                        })
                        .unwrap_or(0),
                    max_steps: challenge.step_count.or(Some(1)),
                    amount: instance.map_or(challenge.amount, |uc| uc.amount),
                    disbursed_amount,
                }
            }
        };
        out.push(summary);
    }
    Ok(out)
}
