//! Entity version store.
//!
//! Every write appends a row. The previously current row of the same key is
//! flipped to `is_current = 0` first, so the partial unique index on current
//! rows holds after every statement. Later transactions of a block read the
//! rows written by earlier ones because they share the block's transaction.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use chainview_core::entity::{EntityType, EntityVersion, EntityWrite};
use chainview_core::error::IndexerError;
use chainview_core::types::BlockRef;

use crate::sqlite::{db, json};

const COLUMNS: &str =
    "id, entity_type, entity_key, blockhash, blocknumber, slot, txhash, is_current, is_delete, fields";

pub(crate) fn from_row(r: &SqliteRow) -> Result<EntityVersion, IndexerError> {
    let entity_type: String = r.get("entity_type");
    let fields: String = r.get("fields");
    Ok(EntityVersion {
        id: r.get("id"),
        entity_type: entity_type.parse()?,
        entity_key: r.get("entity_key"),
        blockhash: r.get("blockhash"),
        blocknumber: r.get::<i64, _>("blocknumber") as u64,
        slot: r.get::<Option<i64>, _>("slot").map(|s| s as u64),
        txhash: r.get("txhash"),
        is_current: r.get("is_current"),
        is_delete: r.get("is_delete"),
        fields: serde_json::from_str(&fields).map_err(json)?,
    })
}

fn from_rows(rows: Vec<SqliteRow>) -> Result<Vec<EntityVersion>, IndexerError> {
    rows.iter().map(from_row).collect()
}

/// Append `write` as the new current version of its key.
pub async fn apply_transaction(
    conn: &mut SqliteConnection,
    write: &EntityWrite,
    block: &BlockRef,
    txhash: &str,
) -> Result<EntityVersion, IndexerError> {
    let fields = serde_json::to_string(&write.fields).map_err(json)?;

    sqlx::query(
        "UPDATE entity_versions SET is_current = 0
         WHERE entity_type = ? AND entity_key = ? AND is_current = 1",
    )
    .bind(write.entity_type.as_str())
    .bind(&write.entity_key)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    let res = sqlx::query(
        "INSERT INTO entity_versions
            (entity_type, entity_key, blockhash, blocknumber, slot, txhash, is_current, is_delete, fields)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(write.entity_type.as_str())
    .bind(&write.entity_key)
    .bind(&block.blockhash)
    .bind(block.blocknumber as i64)
    .bind(block.slot.map(|s| s as i64))
    .bind(txhash)
    .bind(write.is_delete)
    .bind(&fields)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    debug!(
        entity_type = %write.entity_type,
        key = %write.entity_key,
        block = block.blocknumber,
        is_delete = write.is_delete,
        "version applied"
    );

    Ok(EntityVersion {
        id: res.last_insert_rowid(),
        entity_type: write.entity_type,
        entity_key: write.entity_key.clone(),
        blockhash: block.blockhash.clone(),
        blocknumber: block.blocknumber,
        slot: block.slot,
        txhash: txhash.to_string(),
        is_current: true,
        is_delete: write.is_delete,
        fields: write.fields.clone(),
    })
}

/// The current version of a key, including delete versions.
pub async fn current(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    key: &str,
) -> Result<Option<EntityVersion>, IndexerError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entity_versions
         WHERE entity_type = ? AND entity_key = ? AND is_current = 1"
    ))
    .bind(entity_type.as_str())
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;
    row.as_ref().map(from_row).transpose()
}

/// The current version of a key, unless it is deleted or never existed.
pub async fn live(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    key: &str,
) -> Result<Option<EntityVersion>, IndexerError> {
    Ok(current(conn, entity_type, key).await?.filter(|v| !v.is_delete))
}

/// Every version of a key, oldest first.
pub async fn history(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    key: &str,
) -> Result<Vec<EntityVersion>, IndexerError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entity_versions
         WHERE entity_type = ? AND entity_key = ? ORDER BY blocknumber, id"
    ))
    .bind(entity_type.as_str())
    .bind(key)
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    from_rows(rows)
}

/// Live rows of one entity type, ordered by key.
pub async fn current_of_type(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
) -> Result<Vec<EntityVersion>, IndexerError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entity_versions
         WHERE entity_type = ? AND is_current = 1 AND is_delete = 0 ORDER BY entity_key"
    ))
    .bind(entity_type.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    from_rows(rows)
}

/// Number of live rows of `entity_type` whose key starts with `prefix`.
///
/// Relation keys lead with the acting user (`{user}:...`), so `"7:"` counts
/// the follows, saves or reposts of user 7.
pub async fn live_count_by_prefix(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    prefix: &str,
) -> Result<u64, IndexerError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM entity_versions
         WHERE entity_type = ? AND is_current = 1 AND is_delete = 0
           AND substr(entity_key, 1, length(?)) = ?",
    )
    .bind(entity_type.as_str())
    .bind(prefix)
    .bind(prefix)
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;
    let cnt: i64 = row.get("cnt");
    Ok(cnt as u64)
}

/// Rows written by `blockhash`, newest first.
pub async fn written_in_block(
    conn: &mut SqliteConnection,
    blockhash: &str,
) -> Result<Vec<EntityVersion>, IndexerError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entity_versions WHERE blockhash = ? ORDER BY id DESC"
    ))
    .bind(blockhash)
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    from_rows(rows)
}

/// Latest version of a key written strictly below `blocknumber`.
pub(crate) async fn latest_before(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    key: &str,
    blocknumber: u64,
) -> Result<Option<EntityVersion>, IndexerError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entity_versions
         WHERE entity_type = ? AND entity_key = ? AND blocknumber < ?
         ORDER BY blocknumber DESC, id DESC LIMIT 1"
    ))
    .bind(entity_type.as_str())
    .bind(key)
    .bind(blocknumber as i64)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;
    row.as_ref().map(from_row).transpose()
}

pub(crate) async fn delete_version(conn: &mut SqliteConnection, id: i64) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM entity_versions WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

pub(crate) async fn mark_current(conn: &mut SqliteConnection, id: i64) -> Result<(), IndexerError> {
    sqlx::query("UPDATE entity_versions SET is_current = 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

/// Number of keys that have more than one current row. Always 0 after a
/// committed block; used by consistency checks.
pub async fn duplicate_current_keys(conn: &mut SqliteConnection) -> Result<u64, IndexerError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM (
             SELECT entity_type, entity_key FROM entity_versions
             WHERE is_current = 1 GROUP BY entity_type, entity_key HAVING COUNT(*) > 1
         )",
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;
    let cnt: i64 = row.get("cnt");
    Ok(cnt as u64)
}

/// Total number of version rows.
pub async fn version_count(conn: &mut SqliteConnection) -> Result<u64, IndexerError> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM entity_versions")
        .fetch_one(&mut *conn)
        .await
        .map_err(db)?;
    let cnt: i64 = row.get("cnt");
    Ok(cnt as u64)
}
