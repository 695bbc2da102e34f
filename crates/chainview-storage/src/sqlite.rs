//! SQLite storage backend for ChainView.
//!
//! All tables live in one SQLite file. Uses `sqlx` with WAL mode for
//! concurrent read performance. Store functions in the sibling modules take a
//! `&mut SqliteConnection`, so the same call works against a pooled
//! connection or inside the block's transaction.
//!
//! # Usage
//! ```rust,no_run
//! use chainview_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./chainview.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};

use chainview_core::error::IndexerError;

/// Map a `sqlx` error into the pipeline's storage error.
pub(crate) fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// Map a JSON (de)serialization failure of a stored column.
pub(crate) fn json(e: serde_json::Error) -> IndexerError {
    IndexerError::Storage(format!("json column: {e}"))
}

const SCHEMA: &[&str] = &[
    // Indexed blocks (for fork detection). Exactly one row is current.
    "CREATE TABLE IF NOT EXISTS blocks (
        blockhash   TEXT    PRIMARY KEY,
        parenthash  TEXT    NOT NULL,
        number      INTEGER NOT NULL UNIQUE,
        is_current  INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_current ON blocks (is_current) WHERE is_current = 1;",
    // Versioned entities. At most one current row per key.
    "CREATE TABLE IF NOT EXISTS entity_versions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type  TEXT    NOT NULL,
        entity_key   TEXT    NOT NULL,
        blockhash    TEXT    NOT NULL,
        blocknumber  INTEGER NOT NULL,
        slot         INTEGER,
        txhash       TEXT    NOT NULL,
        is_current   INTEGER NOT NULL,
        is_delete    INTEGER NOT NULL,
        fields       TEXT    NOT NULL
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_entity_current
        ON entity_versions (entity_type, entity_key) WHERE is_current = 1;",
    "CREATE INDEX IF NOT EXISTS idx_entity_history
        ON entity_versions (entity_type, entity_key, blocknumber);",
    "CREATE INDEX IF NOT EXISTS idx_entity_block ON entity_versions (blockhash);",
    // Checkpoints
    "CREATE TABLE IF NOT EXISTS indexing_checkpoints (
        stream_name     TEXT    PRIMARY KEY,
        last_checkpoint INTEGER NOT NULL,
        updated_at      TEXT    NOT NULL
    );",
    // Append-only revert log
    "CREATE TABLE IF NOT EXISTS revert_log (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        blocknumber  INTEGER NOT NULL,
        blockhash    TEXT    NOT NULL,
        entity_type  TEXT    NOT NULL,
        entity_key   TEXT    NOT NULL,
        version_id   INTEGER NOT NULL,
        action       TEXT    NOT NULL,
        record       TEXT    NOT NULL,
        reverted_at  TEXT    NOT NULL,
        UNIQUE (blockhash, version_id, action)
    );",
    "CREATE INDEX IF NOT EXISTS idx_revert_log_block ON revert_log (blocknumber);",
    // Skipped transactions
    "CREATE TABLE IF NOT EXISTS skipped_transactions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        blocknumber  INTEGER NOT NULL,
        blockhash    TEXT    NOT NULL,
        txhash       TEXT    NOT NULL,
        level        TEXT    NOT NULL,
        message      TEXT    NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 1,
        created_at   TEXT    NOT NULL,
        UNIQUE (blockhash, txhash)
    );",
    // Challenges
    "CREATE TABLE IF NOT EXISTS challenges (
        id              TEXT    PRIMARY KEY,
        challenge_type  TEXT    NOT NULL,
        amount          INTEGER NOT NULL,
        active          INTEGER NOT NULL,
        step_count      INTEGER,
        starting_block  INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS user_challenges (
        challenge_id          TEXT    NOT NULL,
        specifier             TEXT    NOT NULL,
        user_id               INTEGER NOT NULL,
        is_complete           INTEGER NOT NULL,
        current_step_count    INTEGER,
        completed_blocknumber INTEGER,
        amount                INTEGER NOT NULL,
        created_at            TEXT    NOT NULL,
        PRIMARY KEY (challenge_id, specifier)
    );",
    "CREATE INDEX IF NOT EXISTS idx_user_challenges_user ON user_challenges (user_id);",
    "CREATE TABLE IF NOT EXISTS challenge_disbursements (
        challenge_id  TEXT    NOT NULL,
        specifier     TEXT    NOT NULL,
        user_id       INTEGER NOT NULL,
        amount        INTEGER NOT NULL,
        signature     TEXT    NOT NULL,
        slot          INTEGER NOT NULL,
        created_at    TEXT    NOT NULL,
        PRIMARY KEY (challenge_id, specifier)
    );",
    // Durable challenge bus log
    "CREATE TABLE IF NOT EXISTS challenge_events (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        event         TEXT    NOT NULL,
        block_number  INTEGER NOT NULL,
        blockhash     TEXT,
        user_id       INTEGER NOT NULL,
        extra         TEXT    NOT NULL,
        created_at    TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_challenge_events_block ON challenge_events (blockhash);",
];

/// SQLite-backed storage for the whole pipeline.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainview.db"`) or a full
    /// SQLite URL (`"sqlite:./chainview.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db)?;

        let storage = Self { pool };
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&storage.pool)
            .await
            .map_err(db)?;
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is
    /// pinned to a single connection that is never recycled. All data is lost
    /// when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and indexes.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a database transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, IndexerError> {
        self.pool.begin().await.map_err(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(row.0, 9);
    }

    #[tokio::test]
    async fn one_current_row_per_key_is_enforced() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let insert = "INSERT INTO entity_versions
            (entity_type, entity_key, blockhash, blocknumber, txhash, is_current, is_delete, fields)
            VALUES ('User', '1', '0xa', 1, '0x1', 1, 0, '{}')";
        sqlx::query(insert).execute(store.pool()).await.unwrap();
        let err = sqlx::query(insert).execute(store.pool()).await.unwrap_err();
        let unique = err
            .as_database_error()
            .map(|e| e.is_unique_violation())
            .unwrap_or(false);
        assert!(unique);
    }
}
