//! Challenge tables: definitions, user challenges, disbursements and the
//! durable challenge event log.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use chainview_core::challenge::{
    Challenge, ChallengeDisbursement, ChallengeEvent, ChallengeEventRecord, UserChallenge,
};
use chainview_core::error::IndexerError;

use crate::sqlite::{db, json};

// ─── Challenges ───────────────────────────────────────────────────────────────

fn challenge_from_row(r: &SqliteRow) -> Result<Challenge, IndexerError> {
    let kind: String = r.get("challenge_type");
    Ok(Challenge {
        id: r.get("id"),
        challenge_type: kind.parse()?,
        amount: r.get::<i64, _>("amount") as u64,
        active: r.get("active"),
        step_count: r.get::<Option<i64>, _>("step_count").map(|v| v as u32),
        starting_block: r.get::<Option<i64>, _>("starting_block").map(|v| v as u64),
    })
}

/// Insert or replace a challenge definition.
pub async fn upsert_challenge(conn: &mut SqliteConnection, c: &Challenge) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO challenges (id, challenge_type, amount, active, step_count, starting_block)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             challenge_type = excluded.challenge_type,
             amount         = excluded.amount,
             active         = excluded.active,
             step_count     = excluded.step_count,
             starting_block = excluded.starting_block",
    )
    .bind(&c.id)
    .bind(c.challenge_type.as_str())
    .bind(c.amount as i64)
    .bind(c.active)
    .bind(c.step_count.map(i64::from))
    .bind(c.starting_block.map(|v| v as i64))
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

pub async fn get_challenge(conn: &mut SqliteConnection, id: &str) -> Result<Option<Challenge>, IndexerError> {
    let row = sqlx::query("SELECT * FROM challenges WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(challenge_from_row).transpose()
}

pub async fn all_challenges(conn: &mut SqliteConnection) -> Result<Vec<Challenge>, IndexerError> {
    let rows = sqlx::query("SELECT * FROM challenges ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;
    rows.iter().map(challenge_from_row).collect()
}

// ─── User challenges ──────────────────────────────────────────────────────────

fn user_challenge_from_row(r: &SqliteRow) -> UserChallenge {
    UserChallenge {
        challenge_id: r.get("challenge_id"),
        specifier: r.get("specifier"),
        user_id: r.get::<i64, _>("user_id") as u64,
        is_complete: r.get("is_complete"),
        current_step_count: r.get::<Option<i64>, _>("current_step_count").map(|v| v as u32),
        completed_blocknumber: r.get::<Option<i64>, _>("completed_blocknumber").map(|v| v as u64),
        amount: r.get::<i64, _>("amount") as u64,
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    }
}

pub async fn get_user_challenge(
    conn: &mut SqliteConnection,
    challenge_id: &str,
    specifier: &str,
) -> Result<Option<UserChallenge>, IndexerError> {
    let row = sqlx::query("SELECT * FROM user_challenges WHERE challenge_id = ? AND specifier = ?")
        .bind(challenge_id)
        .bind(specifier)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(user_challenge_from_row))
}

/// Existing instances of `challenge_id` among `specifiers`.
pub async fn user_challenges_for(
    conn: &mut SqliteConnection,
    challenge_id: &str,
    specifiers: &[String],
) -> Result<Vec<UserChallenge>, IndexerError> {
    let mut out = Vec::new();
    for specifier in specifiers {
        if let Some(uc) = get_user_challenge(conn, challenge_id, specifier).await? {
            out.push(uc);
        }
    }
    Ok(out)
}

/// Every instance of `challenge_id` owned by `user_id`.
pub async fn user_instances(
    conn: &mut SqliteConnection,
    challenge_id: &str,
    user_id: u64,
) -> Result<Vec<UserChallenge>, IndexerError> {
    let rows = sqlx::query(
        "SELECT * FROM user_challenges WHERE challenge_id = ? AND user_id = ? ORDER BY created_at, specifier",
    )
    .bind(challenge_id)
    .bind(user_id as i64)
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    Ok(rows.iter().map(user_challenge_from_row).collect())
}

/// Every instance owned by `user_id`, across challenges.
pub async fn user_challenges_by_user(
    conn: &mut SqliteConnection,
    user_id: u64,
) -> Result<Vec<UserChallenge>, IndexerError> {
    let rows = sqlx::query("SELECT * FROM user_challenges WHERE user_id = ? ORDER BY challenge_id, specifier")
        .bind(user_id as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;
    Ok(rows.iter().map(user_challenge_from_row).collect())
}

/// Insert or update a user challenge.
pub async fn save_user_challenge(conn: &mut SqliteConnection, uc: &UserChallenge) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO user_challenges
            (challenge_id, specifier, user_id, is_complete, current_step_count,
             completed_blocknumber, amount, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(challenge_id, specifier) DO UPDATE SET
             is_complete           = excluded.is_complete,
             current_step_count    = excluded.current_step_count,
             completed_blocknumber = excluded.completed_blocknumber",
    )
    .bind(&uc.challenge_id)
    .bind(&uc.specifier)
    .bind(uc.user_id as i64)
    .bind(uc.is_complete)
    .bind(uc.current_step_count.map(i64::from))
    .bind(uc.completed_blocknumber.map(|v| v as i64))
    .bind(uc.amount as i64)
    .bind(uc.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

// ─── Disbursements ────────────────────────────────────────────────────────────

/// Insert a disbursement row. The primary key is the exactly-once guard: a
/// second row for the same `(challenge_id, specifier)` fails with
/// `AlreadyDisbursed`.
pub async fn insert_disbursement(
    conn: &mut SqliteConnection,
    d: &ChallengeDisbursement,
) -> Result<(), IndexerError> {
    let res = sqlx::query(
        "INSERT INTO challenge_disbursements
            (challenge_id, specifier, user_id, amount, signature, slot, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&d.challenge_id)
    .bind(&d.specifier)
    .bind(d.user_id as i64)
    .bind(d.amount as i64)
    .bind(&d.signature)
    .bind(d.slot as i64)
    .bind(d.created_at)
    .execute(&mut *conn)
    .await;

    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(IndexerError::AlreadyDisbursed {
            challenge_id: d.challenge_id.clone(),
            specifier: d.specifier.clone(),
        }),
        Err(e) => Err(db(e)),
    }
}

fn disbursement_from_row(r: &SqliteRow) -> ChallengeDisbursement {
    ChallengeDisbursement {
        challenge_id: r.get("challenge_id"),
        specifier: r.get("specifier"),
        user_id: r.get::<i64, _>("user_id") as u64,
        amount: r.get::<i64, _>("amount") as u64,
        signature: r.get("signature"),
        slot: r.get::<i64, _>("slot") as u64,
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    }
}

pub async fn get_disbursement(
    conn: &mut SqliteConnection,
    challenge_id: &str,
    specifier: &str,
) -> Result<Option<ChallengeDisbursement>, IndexerError> {
    let row = sqlx::query("SELECT * FROM challenge_disbursements WHERE challenge_id = ? AND specifier = ?")
        .bind(challenge_id)
        .bind(specifier)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(disbursement_from_row))
}

pub async fn disbursements_for_user(
    conn: &mut SqliteConnection,
    user_id: u64,
) -> Result<Vec<ChallengeDisbursement>, IndexerError> {
    let rows = sqlx::query("SELECT * FROM challenge_disbursements WHERE user_id = ? ORDER BY created_at")
        .bind(user_id as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;
    Ok(rows.iter().map(disbursement_from_row).collect())
}

/// Complete instances of active challenges with no disbursement yet.
pub async fn unpaid_complete(conn: &mut SqliteConnection, limit: u32) -> Result<Vec<UserChallenge>, IndexerError> {
    let rows = sqlx::query(
        "SELECT uc.* FROM user_challenges uc
         JOIN challenges c ON c.id = uc.challenge_id
         LEFT JOIN challenge_disbursements d
             ON d.challenge_id = uc.challenge_id AND d.specifier = uc.specifier
         WHERE uc.is_complete = 1 AND c.active = 1 AND d.challenge_id IS NULL
         ORDER BY uc.completed_blocknumber, uc.challenge_id, uc.specifier
         LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    Ok(rows.iter().map(user_challenge_from_row).collect())
}

// ─── Event log ────────────────────────────────────────────────────────────────

/// Append an event to the durable bus log. Returns its id.
pub async fn insert_event(
    conn: &mut SqliteConnection,
    event: ChallengeEvent,
    block_number: u64,
    blockhash: Option<&str>,
    user_id: u64,
    extra: &serde_json::Value,
) -> Result<i64, IndexerError> {
    let extra = serde_json::to_string(extra).map_err(json)?;
    let res = sqlx::query(
        "INSERT INTO challenge_events (event, block_number, blockhash, user_id, extra, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event.as_str())
    .bind(block_number as i64)
    .bind(blockhash)
    .bind(user_id as i64)
    .bind(&extra)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(res.last_insert_rowid())
}

fn event_from_row(r: &SqliteRow) -> Result<ChallengeEventRecord, IndexerError> {
    let event: String = r.get("event");
    let extra: String = r.get("extra");
    Ok(ChallengeEventRecord {
        id: r.get("id"),
        event: event.parse()?,
        block_number: r.get::<i64, _>("block_number") as u64,
        blockhash: r.get("blockhash"),
        user_id: r.get::<i64, _>("user_id") as u64,
        extra: serde_json::from_str(&extra).map_err(json)?,
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    })
}

/// Events with id above `after_id`, in id order.
pub async fn events_after(
    conn: &mut SqliteConnection,
    after_id: u64,
    limit: u32,
) -> Result<Vec<ChallengeEventRecord>, IndexerError> {
    let rows = sqlx::query("SELECT * FROM challenge_events WHERE id > ? ORDER BY id LIMIT ?")
        .bind(after_id as i64)
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;
    rows.iter().map(event_from_row).collect()
}

/// Drop events from `blockhash` the bus has not consumed yet (id above `marker`).
pub async fn purge_unprocessed_events(
    conn: &mut SqliteConnection,
    blockhash: &str,
    marker: u64,
) -> Result<u64, IndexerError> {
    let res = sqlx::query("DELETE FROM challenge_events WHERE blockhash = ? AND id > ?")
        .bind(blockhash)
        .bind(marker as i64)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    if res.rows_affected() > 0 {
        debug!(blockhash, purged = res.rows_affected(), "unprocessed challenge events purged");
    }
    Ok(res.rows_affected())
}

/// Number of events above `after_id`.
pub async fn pending_event_count(conn: &mut SqliteConnection, after_id: u64) -> Result<u64, IndexerError> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM challenge_events WHERE id > ?")
        .bind(after_id as i64)
        .fetch_one(&mut *conn)
        .await
        .map_err(db)?;
    let cnt: i64 = row.get("cnt");
    Ok(cnt as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStorage;
    use chainview_core::challenge::ChallengeType;
    use serde_json::json;

    fn boolean(id: &str) -> Challenge {
        Challenge {
            id: id.into(),
            challenge_type: ChallengeType::Boolean,
            amount: 5,
            active: true,
            step_count: None,
            starting_block: None,
        }
    }

    #[tokio::test]
    async fn challenge_upsert_replaces() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        upsert_challenge(&mut conn, &boolean("m")).await.unwrap();
        let mut c = boolean("m");
        c.active = false;
        upsert_challenge(&mut conn, &c).await.unwrap();

        let loaded = get_challenge(&mut conn, "m").await.unwrap().unwrap();
        assert!(!loaded.active);
        assert_eq!(all_challenges(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_disbursement_is_rejected() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        let d = ChallengeDisbursement {
            challenge_id: "m".into(),
            specifier: "7".into(),
            user_id: 7,
            amount: 5,
            signature: "sig".into(),
            slot: 100,
            created_at: Utc::now(),
        };
        insert_disbursement(&mut conn, &d).await.unwrap();
        let err = insert_disbursement(&mut conn, &d).await.unwrap_err();
        assert!(matches!(err, IndexerError::AlreadyDisbursed { .. }));
        assert_eq!(disbursements_for_user(&mut conn, 7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unpaid_excludes_disbursed_and_incomplete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let c = boolean("m");
        upsert_challenge(&mut conn, &c).await.unwrap();

        for (user, complete) in [(1u64, true), (2, true), (3, false)] {
            let mut uc = UserChallenge::new(&c, user.to_string(), user, 5);
            if complete {
                uc.complete(10);
            }
            save_user_challenge(&mut conn, &uc).await.unwrap();
        }
        insert_disbursement(
            &mut conn,
            &ChallengeDisbursement {
                challenge_id: "m".into(),
                specifier: "1".into(),
                user_id: 1,
                amount: 5,
                signature: "sig".into(),
                slot: 1,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let unpaid = unpaid_complete(&mut conn, 10).await.unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].specifier, "2");
    }

    #[tokio::test]
    async fn events_roundtrip_in_id_order() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        let a = insert_event(&mut conn, ChallengeEvent::SendTip, 5, None, 1, &json!({"amount": 2}))
            .await
            .unwrap();
        insert_event(&mut conn, ChallengeEvent::TrackUpload, 4, Some("0x4"), 2, &json!(null))
            .await
            .unwrap();

        let events = events_after(&mut conn, 0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, ChallengeEvent::SendTip);
        assert_eq!(events[0].extra["amount"], 2);
        assert_eq!(events[1].blockhash.as_deref(), Some("0x4"));
        assert_eq!(pending_event_count(&mut conn, a as u64).await.unwrap(), 1);
    }
}
