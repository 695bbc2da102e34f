//! Checkpoint store on the `indexing_checkpoints` table.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use chainview_core::checkpoint::Checkpoint;
use chainview_core::error::IndexerError;

use crate::sqlite::db;

/// Last processed position of `stream` (0 if the stream has never advanced).
pub async fn last_checkpoint(conn: &mut SqliteConnection, stream: &str) -> Result<u64, IndexerError> {
    Ok(load(conn, stream).await?.map_or(0, |cp| cp.last_checkpoint))
}

/// Load the checkpoint row for `stream`.
pub async fn load(conn: &mut SqliteConnection, stream: &str) -> Result<Option<Checkpoint>, IndexerError> {
    let row = sqlx::query(
        "SELECT stream_name, last_checkpoint, updated_at FROM indexing_checkpoints WHERE stream_name = ?",
    )
    .bind(stream)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;

    Ok(row.map(|r| Checkpoint {
        stream: r.get("stream_name"),
        last_checkpoint: r.get::<i64, _>("last_checkpoint") as u64,
        updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
    }))
}

/// All checkpoints, ordered by stream name.
pub async fn all(conn: &mut SqliteConnection) -> Result<Vec<Checkpoint>, IndexerError> {
    let rows = sqlx::query(
        "SELECT stream_name, last_checkpoint, updated_at FROM indexing_checkpoints ORDER BY stream_name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;

    Ok(rows
        .into_iter()
        .map(|r| Checkpoint {
            stream: r.get("stream_name"),
            last_checkpoint: r.get::<i64, _>("last_checkpoint") as u64,
            updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
        })
        .collect())
}

/// Move `stream` forward to `position`.
///
/// Must run in the same transaction as the writes it guards. A position that
/// is not above the stored one means the caller is about to re-apply work and
/// fails with `CheckpointMismatch`.
pub async fn advance_checkpoint(
    conn: &mut SqliteConnection,
    stream: &str,
    position: u64,
) -> Result<(), IndexerError> {
    if let Some(stored) = load(conn, stream).await? {
        if position <= stored.last_checkpoint {
            return Err(IndexerError::CheckpointMismatch {
                stream: stream.to_string(),
                stored: stored.last_checkpoint,
                attempted: position,
            });
        }
    }
    upsert(conn, stream, position).await?;
    debug!(stream, position, "checkpoint advanced");
    Ok(())
}

/// Move `stream` back to `position`. Only the revert path calls this.
pub async fn rewind_checkpoint(
    conn: &mut SqliteConnection,
    stream: &str,
    position: u64,
) -> Result<(), IndexerError> {
    let stored = last_checkpoint(conn, stream).await?;
    if position > stored {
        return Err(IndexerError::CheckpointMismatch {
            stream: stream.to_string(),
            stored,
            attempted: position,
        });
    }
    upsert(conn, stream, position).await?;
    debug!(stream, from = stored, to = position, "checkpoint rewound");
    Ok(())
}

/// Forget `stream` entirely. Used when the revert path removes the first indexed block.
pub(crate) async fn clear(conn: &mut SqliteConnection, stream: &str) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM indexing_checkpoints WHERE stream_name = ?")
        .bind(stream)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    debug!(stream, "checkpoint cleared");
    Ok(())
}

async fn upsert(conn: &mut SqliteConnection, stream: &str, position: u64) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO indexing_checkpoints (stream_name, last_checkpoint, updated_at)
         VALUES (?, ?, ?)
         ON CONFLICT(stream_name) DO UPDATE SET
             last_checkpoint = excluded.last_checkpoint,
             updated_at      = excluded.updated_at",
    )
    .bind(stream)
    .bind(position as i64)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}
