//! Indexed block table. The single current row is the local head.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use chainview_core::error::IndexerError;
use chainview_core::types::{ChainBlock, IndexedBlock};

use crate::sqlite::db;

fn from_row(r: &SqliteRow) -> IndexedBlock {
    IndexedBlock {
        blockhash: r.get("blockhash"),
        parenthash: r.get("parenthash"),
        number: r.get::<i64, _>("number") as u64,
        is_current: r.get::<bool, _>("is_current"),
    }
}

/// The local head, if anything has been indexed.
pub async fn current_block(conn: &mut SqliteConnection) -> Result<Option<IndexedBlock>, IndexerError> {
    let row = sqlx::query("SELECT blockhash, parenthash, number, is_current FROM blocks WHERE is_current = 1")
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(from_row))
}

pub async fn get_block(conn: &mut SqliteConnection, blockhash: &str) -> Result<Option<IndexedBlock>, IndexerError> {
    let row = sqlx::query("SELECT blockhash, parenthash, number, is_current FROM blocks WHERE blockhash = ?")
        .bind(blockhash)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(from_row))
}

pub async fn block_at(conn: &mut SqliteConnection, number: u64) -> Result<Option<IndexedBlock>, IndexerError> {
    let row = sqlx::query("SELECT blockhash, parenthash, number, is_current FROM blocks WHERE number = ?")
        .bind(number as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(from_row))
}

/// Record `block` as the new head.
pub async fn insert_current_block(conn: &mut SqliteConnection, block: &ChainBlock) -> Result<(), IndexerError> {
    sqlx::query("UPDATE blocks SET is_current = 0 WHERE is_current = 1")
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    sqlx::query("INSERT INTO blocks (blockhash, parenthash, number, is_current) VALUES (?, ?, ?, 1)")
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(block.number as i64)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

/// Drop `blockhash` from the table. Returns `true` if a row was removed.
pub(crate) async fn delete_block(conn: &mut SqliteConnection, blockhash: &str) -> Result<bool, IndexerError> {
    let res = sqlx::query("DELETE FROM blocks WHERE blockhash = ?")
        .bind(blockhash)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(res.rows_affected() > 0)
}

/// Make `blockhash` the head. Returns `false` if the block is not indexed.
pub(crate) async fn set_current(conn: &mut SqliteConnection, blockhash: &str) -> Result<bool, IndexerError> {
    sqlx::query("UPDATE blocks SET is_current = 0 WHERE is_current = 1")
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    let res = sqlx::query("UPDATE blocks SET is_current = 1 WHERE blockhash = ?")
        .bind(blockhash)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(res.rows_affected() > 0)
}

pub async fn block_count(conn: &mut SqliteConnection) -> Result<u64, IndexerError> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
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

    fn block(number: u64, hash: &str, parent: &str) -> ChainBlock {
        ChainBlock {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: 0,
            slot: None,
            transactions: vec![],
        }
    }

    #[tokio::test]
    async fn head_moves_with_inserts() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        assert!(current_block(&mut conn).await.unwrap().is_none());
        insert_current_block(&mut conn, &block(1, "0x1", "0x0")).await.unwrap();
        insert_current_block(&mut conn, &block(2, "0x2", "0x1")).await.unwrap();

        let head = current_block(&mut conn).await.unwrap().unwrap();
        assert_eq!(head.blockhash, "0x2");
        assert!(!get_block(&mut conn, "0x1").await.unwrap().unwrap().is_current);
        assert_eq!(block_at(&mut conn, 1).await.unwrap().unwrap().blockhash, "0x1");
        assert_eq!(block_count(&mut conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn parent_becomes_head_after_delete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        insert_current_block(&mut conn, &block(1, "0x1", "0x0")).await.unwrap();
        insert_current_block(&mut conn, &block(2, "0x2", "0x1")).await.unwrap();
        assert!(delete_block(&mut conn, "0x2").await.unwrap());
        assert!(set_current(&mut conn, "0x1").await.unwrap());
        assert_eq!(current_block(&mut conn).await.unwrap().unwrap().number, 1);
        assert!(!set_current(&mut conn, "0xmissing").await.unwrap());
    }
}
