//! Per-block buffer of challenge events.
//!
//! The block pass owns the queue while it applies transactions and flushes it
//! on the block's own database transaction just before commit. The events
//! then commit or roll back together with the block.

use sqlx::SqliteConnection;
use tracing::debug;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::error::IndexerError;

use crate::bus::ChallengeEventBus;

/// One buffered event.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: ChallengeEvent,
    pub block_number: u64,
    pub user_id: u64,
    pub extra: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct ChallengeEventQueue {
    blockhash: Option<String>,
    items: Vec<QueuedEvent>,
}

impl ChallengeEventQueue {
    /// A queue not tied to any block (manual dispatch, tests).
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue for the events of `blockhash`.
    pub fn for_block(blockhash: impl Into<String>) -> Self {
        Self {
            blockhash: Some(blockhash.into()),
            items: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, event: ChallengeEvent, block_number: u64, user_id: u64, extra: serde_json::Value) {
        self.items.push(QueuedEvent {
            event,
            block_number,
            user_id,
            extra,
        });
    }

    /// Append the events of another queue (e.g. one transaction's events).
    pub fn extend(&mut self, items: impl IntoIterator<Item = QueuedEvent>) {
        self.items.extend(items);
    }

    pub fn blockhash(&self) -> Option<&str> {
        self.blockhash.as_deref()
    }

    pub fn items(&self) -> &[QueuedEvent] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dispatch every buffered event on `conn`, normally the open block
    /// transaction. Nothing is committed here.
    ///
    /// Returns the number of events accepted by the bus.
    pub async fn flush(self, bus: &ChallengeEventBus, conn: &mut SqliteConnection) -> Result<usize, IndexerError> {
        if self.items.is_empty() {
            return Ok(0);
        }
        let mut accepted = 0;
        for item in &self.items {
            if bus
                .dispatch(
                    &mut *conn,
                    item.event,
                    item.block_number,
                    self.blockhash.as_deref(),
                    item.user_id,
                    &item.extra,
                )
                .await?
            {
                accepted += 1;
            }
        }
        debug!(blockhash = ?self.blockhash, accepted, queued = self.items.len(), "challenge queue flushed");
        Ok(accepted)
    }
}
