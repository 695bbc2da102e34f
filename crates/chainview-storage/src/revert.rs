//! Revert manager: undoes the local head block after a fork.
//!
//! Reverting block `N` removes every version row it wrote, restores the latest
//! version of each touched key below `N`, makes the parent block current and
//! rewinds the `entity_manager` checkpoint. Each removed and restored row is
//! written to the append-only `revert_log`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use chainview_core::checkpoint::{CHALLENGE_EVENTS_STREAM, ENTITY_MANAGER_STREAM};
use chainview_core::entity::{EntityType, EntityVersion};
use chainview_core::error::IndexerError;
use chainview_core::types::IndexedBlock;

use crate::sqlite::{db, json};
use crate::{blocks, challenges, checkpoint, versions};

/// What happened to a version row during a revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevertAction {
    /// Written by the reverted block and removed.
    Reverted,
    /// Superseded by the reverted block and made current again.
    Restored,
}

impl RevertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reverted => "reverted",
            Self::Restored => "restored",
        }
    }
}

/// One row of the revert log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertRecord {
    pub id: i64,
    pub blocknumber: u64,
    pub blockhash: String,
    pub entity_type: EntityType,
    pub entity_key: String,
    pub version_id: i64,
    pub action: RevertAction,
    /// Full snapshot of the version row.
    pub record: serde_json::Value,
    pub reverted_at: DateTime<Utc>,
}

/// Summary of one reverted block.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertReport {
    pub blockhash: String,
    pub blocknumber: u64,
    /// Version rows removed.
    pub reverted: usize,
    /// Prior versions made current again.
    pub restored: usize,
    /// Unprocessed challenge events dropped.
    pub purged_events: u64,
    /// Head after the revert (`None` if the reverted block was the first indexed).
    pub new_head: Option<IndexedBlock>,
}

/// Revert `blockhash` if it is the local head.
///
/// Returns `None` without touching anything when the block is not the current
/// head, so reverting the same block twice is a no-op.
pub async fn revert_block(
    conn: &mut SqliteConnection,
    blockhash: &str,
) -> Result<Option<RevertReport>, IndexerError> {
    let head = match blocks::current_block(conn).await? {
        Some(head) if head.blockhash == blockhash => head,
        _ => {
            debug!(blockhash, "block is not the local head, nothing to revert");
            return Ok(None);
        }
    };

    let written = versions::written_in_block(conn, blockhash).await?;
    let mut touched: Vec<(EntityType, String)> = Vec::new();
    for version in &written {
        log_revert(conn, head.number, blockhash, version, RevertAction::Reverted).await?;
        versions::delete_version(conn, version.id).await?;
        let key = (version.entity_type, version.entity_key.clone());
        if !touched.contains(&key) {
            touched.push(key);
        }
    }

    let mut restored = 0;
    for (entity_type, key) in &touched {
        if let Some(prior) = versions::latest_before(conn, *entity_type, key, head.number).await? {
            versions::mark_current(conn, prior.id).await?;
            let prior = EntityVersion {
                is_current: true,
                ..prior
            };
            log_revert(conn, head.number, blockhash, &prior, RevertAction::Restored).await?;
            restored += 1;
        }
    }

    blocks::delete_block(conn, blockhash).await?;
    let new_head = if blocks::set_current(conn, &head.parenthash).await? {
        blocks::get_block(conn, &head.parenthash).await?
    } else {
        None
    };

    match &new_head {
        // Heights may skip, so the checkpoint follows the parent's own number.
        Some(parent) => {
            if checkpoint::last_checkpoint(conn, ENTITY_MANAGER_STREAM).await? > parent.number {
                checkpoint::rewind_checkpoint(conn, ENTITY_MANAGER_STREAM, parent.number).await?;
            }
        }
        // Nothing indexed any more: the stream restarts from the configured start block.
        None => checkpoint::clear(conn, ENTITY_MANAGER_STREAM).await?,
    }

    let marker = checkpoint::last_checkpoint(conn, CHALLENGE_EVENTS_STREAM).await?;
    let purged_events = challenges::purge_unprocessed_events(conn, blockhash, marker).await?;

    info!(
        block = head.number,
        blockhash,
        reverted = written.len(),
        restored,
        purged_events,
        "block reverted"
    );

    Ok(Some(RevertReport {
        blockhash: blockhash.to_string(),
        blocknumber: head.number,
        reverted: written.len(),
        restored,
        purged_events,
        new_head,
    }))
}

/// Revert head blocks one at a time until the head is below `height`.
pub async fn revert_from(
    conn: &mut SqliteConnection,
    height: u64,
) -> Result<Vec<RevertReport>, IndexerError> {
    let mut reports = Vec::new();
    while let Some(head) = blocks::current_block(conn).await? {
        if head.number < height {
            break;
        }
        match revert_block(conn, &head.blockhash).await? {
            Some(report) => reports.push(report),
            None => break,
        }
    }
    Ok(reports)
}

/// Revert log entries, optionally for one height, in insertion order.
pub async fn revert_log(
    conn: &mut SqliteConnection,
    blocknumber: Option<u64>,
) -> Result<Vec<RevertRecord>, IndexerError> {
    let rows = match blocknumber {
        Some(n) => sqlx::query("SELECT * FROM revert_log WHERE blocknumber = ? ORDER BY id")
            .bind(n as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?,
        None => sqlx::query("SELECT * FROM revert_log ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?,
    };

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        let entity_type: String = r.get("entity_type");
        let action: String = r.get("action");
        let record: String = r.get("record");
        out.push(RevertRecord {
            id: r.get("id"),
            blocknumber: r.get::<i64, _>("blocknumber") as u64,
            blockhash: r.get("blockhash"),
            entity_type: entity_type.parse()?,
            entity_key: r.get("entity_key"),
            version_id: r.get("version_id"),
            action: if action == RevertAction::Restored.as_str() {
                RevertAction::Restored
            } else {
                RevertAction::Reverted
            },
            record: serde_json::from_str(&record).map_err(json)?,
            reverted_at: r.get::<DateTime<Utc>, _>("reverted_at"),
        });
    }
    Ok(out)
}

async fn log_revert(
    conn: &mut SqliteConnection,
    blocknumber: u64,
    blockhash: &str,
    version: &EntityVersion,
    action: RevertAction,
) -> Result<(), IndexerError> {
    let record = serde_json::to_string(version).map_err(json)?;
    sqlx::query(
        "INSERT OR IGNORE INTO revert_log
            (blocknumber, blockhash, entity_type, entity_key, version_id, action, record, reverted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(blocknumber as i64)
    .bind(blockhash)
    .bind(version.entity_type.as_str())
    .bind(&version.entity_key)
    .bind(version.id)
    .bind(action.as_str())
    .bind(&record)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStorage;
    use chainview_core::challenge::ChallengeEvent;
    use chainview_core::entity::EntityWrite;
    use chainview_core::types::ChainBlock;
    use serde_json::json;

    async fn index(conn: &mut SqliteConnection, number: u64, hash: &str, parent: &str, writes: &[EntityWrite]) {
        let block = ChainBlock {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: 0,
            slot: None,
            transactions: vec![],
        };
        blocks::insert_current_block(conn, &block).await.unwrap();
        for (i, w) in writes.iter().enumerate() {
            versions::apply_transaction(conn, w, &block.block_ref(), &format!("{hash}-{i}"))
                .await
                .unwrap();
        }
        checkpoint::advance_checkpoint(conn, ENTITY_MANAGER_STREAM, number).await.unwrap();
    }

    fn user(handle: &str) -> EntityWrite {
        EntityWrite::upsert(EntityType::User, "1", json!({ "handle": handle }))
    }

    #[tokio::test]
    async fn revert_restores_prior_version() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 1, "0x1", "0x0", &[user("a")]).await;
        index(&mut conn, 2, "0x2", "0x1", &[user("b"), user("c")]).await;

        let report = revert_block(&mut conn, "0x2").await.unwrap().unwrap();
        assert_eq!(report.reverted, 2);
        assert_eq!(report.restored, 1);
        assert_eq!(report.new_head.unwrap().blockhash, "0x1");

        let cur = versions::current(&mut conn, EntityType::User, "1").await.unwrap().unwrap();
        assert_eq!(cur.fields["handle"], "a");
        assert_eq!(
            checkpoint::last_checkpoint(&mut conn, ENTITY_MANAGER_STREAM).await.unwrap(),
            1
        );

        let log = revert_log(&mut conn, Some(2)).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(
            log.iter().filter(|r| r.action == RevertAction::Restored).count(),
            1
        );
    }

    #[tokio::test]
    async fn created_entity_reverts_to_never_existed() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 1, "0x1", "0x0", &[]).await;
        let track = EntityWrite::upsert(EntityType::Track, "5", json!({}));
        index(&mut conn, 2, "0x2", "0x1", &[track]).await;

        revert_block(&mut conn, "0x2").await.unwrap().unwrap();
        assert!(versions::current(&mut conn, EntityType::Track, "5").await.unwrap().is_none());
        assert!(versions::history(&mut conn, EntityType::Track, "5").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn double_revert_is_noop() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 1, "0x1", "0x0", &[user("a")]).await;
        index(&mut conn, 2, "0x2", "0x1", &[user("b")]).await;

        assert!(revert_block(&mut conn, "0x2").await.unwrap().is_some());
        let log_len = revert_log(&mut conn, None).await.unwrap().len();
        assert!(revert_block(&mut conn, "0x2").await.unwrap().is_none());
        assert_eq!(revert_log(&mut conn, None).await.unwrap().len(), log_len);
        assert_eq!(blocks::current_block(&mut conn).await.unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn revert_from_walks_back() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 1, "0x1", "0x0", &[user("a")]).await;
        index(&mut conn, 2, "0x2", "0x1", &[user("b")]).await;
        index(&mut conn, 3, "0x3", "0x2", &[user("c")]).await;

        let reports = revert_from(&mut conn, 2).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].blocknumber, 3);
        let cur = versions::current(&mut conn, EntityType::User, "1").await.unwrap().unwrap();
        assert_eq!(cur.fields["handle"], "a");
    }

    #[tokio::test]
    async fn revert_purges_unprocessed_events_of_block() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 1, "0x1", "0x0", &[]).await;
        index(&mut conn, 2, "0x2", "0x1", &[]).await;
        challenges::insert_event(&mut conn, ChallengeEvent::TrackUpload, 1, Some("0x1"), 7, &json!({}))
            .await
            .unwrap();
        challenges::insert_event(&mut conn, ChallengeEvent::TrackUpload, 2, Some("0x2"), 7, &json!({}))
            .await
            .unwrap();

        let report = revert_block(&mut conn, "0x2").await.unwrap().unwrap();
        assert_eq!(report.purged_events, 1);
        assert_eq!(challenges::events_after(&mut conn, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_rewinds_to_parent_height_across_gaps() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 10, "0xa", "0x9", &[user("a")]).await;
        index(&mut conn, 14, "0xe", "0xa", &[user("b")]).await;

        revert_block(&mut conn, "0xe").await.unwrap().unwrap();
        assert_eq!(
            checkpoint::last_checkpoint(&mut conn, ENTITY_MANAGER_STREAM).await.unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn reverting_first_block_leaves_no_head() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        index(&mut conn, 5, "0x5", "0x4", &[user("a")]).await;
        let report = revert_block(&mut conn, "0x5").await.unwrap().unwrap();
        assert!(report.new_head.is_none());
        assert!(blocks::current_block(&mut conn).await.unwrap().is_none());
        assert!(checkpoint::load(&mut conn, ENTITY_MANAGER_STREAM).await.unwrap().is_none());
    }
}
