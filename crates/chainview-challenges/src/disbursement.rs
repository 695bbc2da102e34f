//! Disbursement ledger: exactly-once payment records.
//!
//! Whether an instance has been paid is decided only by the
//! `challenge_disbursements` primary key. The completion check here gates
//! eligibility; it is not what prevents double payment.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::info;

use chainview_core::challenge::{ChallengeDisbursement, UserChallenge};
use chainview_core::error::IndexerError;
use chainview_storage::challenges;

#[derive(Debug, Default, Clone, Copy)]
pub struct DisbursementLedger;

impl DisbursementLedger {
    pub fn new() -> Self {
        Self
    }

    /// Record the payment of `(challenge_id, specifier)`.
    ///
    /// Fails with `NotComplete` if the instance is missing or incomplete and
    /// with `AlreadyDisbursed` if it has been paid before.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        challenge_id: &str,
        specifier: &str,
        signature: &str,
        slot: u64,
    ) -> Result<ChallengeDisbursement, IndexerError> {
        let instance = challenges::get_user_challenge(conn, challenge_id, specifier)
            .await?
            .filter(|uc| uc.is_complete)
            .ok_or_else(|| IndexerError::NotComplete {
                challenge_id: challenge_id.to_string(),
                specifier: specifier.to_string(),
            })?;

        let disbursement = ChallengeDisbursement {
            challenge_id: instance.challenge_id.clone(),
            specifier: instance.specifier.clone(),
            user_id: instance.user_id,
            amount: instance.amount,
            signature: signature.to_string(),
            slot,
            created_at: Utc::now(),
        };
        challenges::insert_disbursement(conn, &disbursement).await?;

        info!(
            challenge = challenge_id,
            specifier,
            user_id = instance.user_id,
            amount = instance.amount,
            slot,
            "challenge disbursed"
        );
        Ok(disbursement)
    }

    /// Complete, unpaid instances of active challenges.
    pub async fn eligible(&self, conn: &mut SqliteConnection, limit: u32) -> Result<Vec<UserChallenge>, IndexerError> {
        challenges::unpaid_complete(conn, limit).await
    }
}
