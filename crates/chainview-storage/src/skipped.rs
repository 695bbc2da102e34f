//! Skipped-transaction log.
//!
//! `network` rows are permanent: the skip decision depends only on chain data,
//! so every indexer replaying the chain records the same set. `node` rows
//! count attempts of a transiently failing transaction. The row is cleared if
//! the transaction later applies.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use chainview_core::error::IndexerError;

use crate::sqlite::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipLevel {
    Node,
    Network,
}

impl SkipLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for SkipLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTransaction {
    pub blocknumber: u64,
    pub blockhash: String,
    pub txhash: String,
    pub level: SkipLevel,
    pub message: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

fn from_row(r: &SqliteRow) -> SkippedTransaction {
    let level: String = r.get("level");
    SkippedTransaction {
        blocknumber: r.get::<i64, _>("blocknumber") as u64,
        blockhash: r.get("blockhash"),
        txhash: r.get("txhash"),
        level: if level == "network" {
            SkipLevel::Network
        } else {
            SkipLevel::Node
        },
        message: r.get("message"),
        attempts: r.get::<i64, _>("attempts") as u32,
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    }
}

/// Record a skip (or another attempt) for `(blockhash, txhash)`.
///
/// Returns the attempt count after this call.
pub async fn record_skipped(
    conn: &mut SqliteConnection,
    blocknumber: u64,
    blockhash: &str,
    txhash: &str,
    level: SkipLevel,
    message: &str,
) -> Result<u32, IndexerError> {
    sqlx::query(
        "INSERT INTO skipped_transactions
            (blocknumber, blockhash, txhash, level, message, attempts, created_at)
         VALUES (?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(blockhash, txhash) DO UPDATE SET
             attempts = attempts + 1,
             level    = excluded.level,
             message  = excluded.message",
    )
    .bind(blocknumber as i64)
    .bind(blockhash)
    .bind(txhash)
    .bind(level.as_str())
    .bind(message)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    let attempts = attempts(conn, blockhash, txhash).await?;
    warn!(
        block = blocknumber,
        tx = txhash,
        level = %level,
        attempts,
        reason = message,
        "transaction skipped"
    );
    Ok(attempts)
}

/// Attempts recorded for `(blockhash, txhash)` (0 if none).
pub async fn attempts(conn: &mut SqliteConnection, blockhash: &str, txhash: &str) -> Result<u32, IndexerError> {
    let row = sqlx::query("SELECT attempts FROM skipped_transactions WHERE blockhash = ? AND txhash = ?")
        .bind(blockhash)
        .bind(txhash)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.map_or(0, |r| r.get::<i64, _>("attempts") as u32))
}

pub async fn get(
    conn: &mut SqliteConnection,
    blockhash: &str,
    txhash: &str,
) -> Result<Option<SkippedTransaction>, IndexerError> {
    let row = sqlx::query("SELECT * FROM skipped_transactions WHERE blockhash = ? AND txhash = ?")
        .bind(blockhash)
        .bind(txhash)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    Ok(row.as_ref().map(from_row))
}

/// Skipped transactions, optionally filtered by level, in block order.
pub async fn list(
    conn: &mut SqliteConnection,
    level: Option<SkipLevel>,
) -> Result<Vec<SkippedTransaction>, IndexerError> {
    let rows = match level {
        Some(level) => sqlx::query(
            "SELECT * FROM skipped_transactions WHERE level = ? ORDER BY blocknumber, id",
        )
        .bind(level.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?,
        None => sqlx::query("SELECT * FROM skipped_transactions ORDER BY blocknumber, id")
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?,
    };
    Ok(rows.iter().map(from_row).collect())
}

/// Drop a node-level row once its transaction has applied.
pub async fn clear_node_skip(conn: &mut SqliteConnection, blockhash: &str, txhash: &str) -> Result<bool, IndexerError> {
    let res = sqlx::query(
        "DELETE FROM skipped_transactions WHERE blockhash = ? AND txhash = ? AND level = 'node'",
    )
    .bind(blockhash)
    .bind(txhash)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(res.rows_affected() > 0)
}
