//! Challenge event bus: durable dispatch and batched processing.
//!
//! `dispatch` appends to the `challenge_events` log. `process_events` reads the
//! events after the `challenge_events` checkpoint, routes them to every
//! listening manager and advances the checkpoint in the same transaction.

use std::sync::Arc;

use sqlx::{Connection, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use chainview_core::challenge::{ChallengeEvent, ChallengeEventRecord};
use chainview_core::checkpoint::CHALLENGE_EVENTS_STREAM;
use chainview_core::error::IndexerError;
use chainview_storage::{challenges, checkpoint};

use crate::registry::ChallengeRegistry;

/// Outcome of one `process_events` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Events consumed.
    pub count: usize,
    /// At least one manager failed and was rolled back.
    pub did_error: bool,
}

pub struct ChallengeEventBus {
    registry: Arc<ChallengeRegistry>,
    batch_size: u32,
}

impl ChallengeEventBus {
    pub fn new(registry: Arc<ChallengeRegistry>, batch_size: u32) -> Self {
        Self {
            registry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ChallengeRegistry> {
        &self.registry
    }

    /// Append an event to the durable log.
    ///
    /// Returns `false` (with a warning) when the event is rejected. `extra`
    /// must be a JSON object or null.
    pub async fn dispatch(
        &self,
        conn: &mut SqliteConnection,
        event: ChallengeEvent,
        block_number: u64,
        blockhash: Option<&str>,
        user_id: u64,
        extra: &serde_json::Value,
    ) -> Result<bool, IndexerError> {
        if !(extra.is_object() || extra.is_null()) {
            warn!(event = %event, user_id, block = block_number, "rejected challenge event: extra is not an object");
            return Ok(false);
        }
        let extra = if extra.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            extra.clone()
        };
        let id = challenges::insert_event(conn, event, block_number, blockhash, user_id, &extra).await?;
        debug!(id, event = %event, user_id, block = block_number, "challenge event dispatched");
        Ok(true)
    }

    /// Consume the next batch of events.
    pub async fn process_events(&self, pool: &SqlitePool) -> Result<ProcessSummary, IndexerError> {
        let mut tx = pool.begin().await.map_err(|e| IndexerError::Storage(e.to_string()))?;

        let marker = checkpoint::last_checkpoint(&mut tx, CHALLENGE_EVENTS_STREAM).await?;
        let mut events = challenges::events_after(&mut tx, marker, self.batch_size).await?;
        if events.is_empty() {
            return Ok(ProcessSummary::default());
        }
        let last_id = events.iter().map(|e| e.id).max().unwrap_or(0) as u64;

        events.sort_by_key(|e| (e.block_number, e.id));
        let mut did_error = false;

        for (event, group) in group_by_event(&events) {
            for challenge_id in self.registry.listeners(event) {
                let Some(manager) = self.registry.get(challenge_id) else {
                    continue;
                };
                let mut savepoint = Connection::begin(&mut *tx)
                    .await
                    .map_err(|e| IndexerError::Storage(e.to_string()))?;
                match manager.process(&mut savepoint, event, &group).await {
                    Ok(touched) => {
                        savepoint
                            .commit()
                            .await
                            .map_err(|e| IndexerError::Storage(e.to_string()))?;
                        debug!(challenge = %challenge_id, event = %event, touched, "manager done");
                    }
                    Err(e) => {
                        savepoint
                            .rollback()
                            .await
                            .map_err(|e| IndexerError::Storage(e.to_string()))?;
                        warn!(challenge = %challenge_id, event = %event, error = %e, "challenge manager failed");
                        did_error = true;
                    }
                }
            }
        }

        checkpoint::advance_checkpoint(&mut tx, CHALLENGE_EVENTS_STREAM, last_id).await?;
        tx.commit().await.map_err(|e| IndexerError::Storage(e.to_string()))?;

        info!(count = events.len(), last_id, did_error, "challenge events processed");
        Ok(ProcessSummary {
            count: events.len(),
            did_error,
        })
    }
}

/// Group events by type, preserving block order inside each group. Groups are
/// ordered by their earliest event.
fn group_by_event(events: &[ChallengeEventRecord]) -> Vec<(ChallengeEvent, Vec<ChallengeEventRecord>)> {
    let mut groups: Vec<(ChallengeEvent, Vec<ChallengeEventRecord>)> = Vec::new();
    for e in events {
        match groups.iter_mut().find(|(event, _)| *event == e.event) {
            Some((_, group)) => group.push(e.clone()),
            None => groups.push((e.event, vec![e.clone()])),
        }
    }
    groups
}
