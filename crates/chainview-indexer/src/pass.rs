//! The block pass: moves the local head along the canonical chain.
//!
//! # Each step
//! 1. Compare the local head with the source (orphaned head / parent mismatch).
//!    On a fork, revert head blocks one at a time, each in its own transaction,
//!    until the head is canonical again.
//! 2. Otherwise fetch `head + 1`, sort its transactions and apply them in one
//!    database transaction together with the block row and the checkpoint.
//! 3. Flush the block's challenge events on that same transaction before it
//!    commits, so a block and its events are stored together or not at all.
//!
//! # Skips
//! Deterministically invalid transactions are recorded as network-level skips
//! inside the block transaction. A transient failure rolls the block back,
//! records the attempt on its own, and leaves the block for the next pass until
//! `node_skip_retry_limit` attempts have been made.

use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use tokio::sync::RwLock;

use chainview_challenges::{ChallengeEventBus, ChallengeEventQueue};
use chainview_core::checkpoint::ENTITY_MANAGER_STREAM;
use chainview_core::config::{IndexerConfig, IndexerState};
use chainview_core::error::{IndexerError, TxError};
use chainview_core::reorg::{ForkCheck, ReorgDetector, ReorgEvent, ReorgType};
use chainview_core::sorter::TransactionSorter;
use chainview_core::types::{BlockSummary, ChainBlock, ChainTransaction, IndexedBlock};
use chainview_storage::skipped::{self, SkipLevel};
use chainview_storage::{blocks, checkpoint, revert, versions, SqliteStorage};

use crate::handler::{HandlerRegistry, TxContext, TxEffects};
use crate::metadata::MetadataResolver;
use crate::source::BlockSource;

// ─── Outcomes ─────────────────────────────────────────────────────────────────

/// A block that has been committed together with its challenge events.
#[derive(Debug)]
pub struct CommittedBlock {
    pub number: u64,
    pub blockhash: String,
    /// Transactions that applied.
    pub applied: usize,
    /// Transactions skipped at network or node level.
    pub skipped: usize,
    /// Events the bus accepted in the block's transaction.
    pub events: usize,
}

/// Result of one step of the block pass.
#[derive(Debug)]
pub enum BlockOutcome {
    Indexed(CommittedBlock),
    /// The block is at or below the checkpoint; nothing was touched.
    AlreadyIndexed { number: u64 },
    /// The local head was orphaned and has been reverted.
    Reverted(ReorgEvent),
    /// A transaction failed transiently; the block was rolled back.
    RetryLater {
        number: u64,
        tx_hash: String,
        attempts: u32,
    },
    /// The source has no block after the local head yet.
    CaughtUp,
}

/// Totals for one `run_pass`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub indexed: u64,
    pub reverted: u64,
    pub skipped: u64,
    /// Events accepted by the bus.
    pub events: usize,
    /// Local head after the pass.
    pub head: Option<u64>,
    /// The pass stopped on a block waiting for a retry.
    pub stalled: bool,
}

// ─── BlockIndexer ─────────────────────────────────────────────────────────────

pub struct BlockIndexer {
    config: IndexerConfig,
    storage: SqliteStorage,
    source: Arc<dyn BlockSource>,
    metadata: Arc<dyn MetadataResolver>,
    handlers: HandlerRegistry,
    bus: Arc<ChallengeEventBus>,
    sorter: TransactionSorter,
    detector: ReorgDetector,
    state: RwLock<IndexerState>,
}

impl BlockIndexer {
    pub fn new(
        config: IndexerConfig,
        storage: SqliteStorage,
        source: Arc<dyn BlockSource>,
        metadata: Arc<dyn MetadataResolver>,
        bus: Arc<ChallengeEventBus>,
    ) -> Self {
        Self {
            sorter: TransactionSorter::new(config.tx_index_sort_start_block),
            detector: ReorgDetector::new(config.max_reorg_depth),
            handlers: HandlerRegistry::with_defaults(),
            state: RwLock::new(IndexerState::Idle),
            config,
            storage,
            source,
            metadata,
            bus,
        }
    }

    /// Replace the default entity handlers.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub async fn state(&self) -> IndexerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: IndexerState) {
        *self.state.write().await = state;
    }

    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, IndexerError> {
        self.storage
            .pool()
            .acquire()
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))
    }

    /// Index up to `max_blocks_per_pass` blocks.
    pub async fn run_pass(&self) -> Result<PassReport, IndexerError> {
        self.set_state(IndexerState::Indexing).await;
        let mut report = PassReport::default();
        match self.pass(&mut report).await {
            Ok(()) => {
                self.set_state(IndexerState::Idle).await;
                tracing::info!(
                    indexed = report.indexed,
                    reverted = report.reverted,
                    skipped = report.skipped,
                    events = report.events,
                    head = ?report.head,
                    stalled = report.stalled,
                    "Index pass complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(IndexerState::Error).await;
                tracing::error!(error = %e, "Index pass failed");
                Err(e)
            }
        }
    }

    async fn pass(&self, report: &mut PassReport) -> Result<(), IndexerError> {
        let source_head = self.source.head_number().await?;
        tracing::debug!(source_head, "Starting index pass");

        for _ in 0..self.config.max_blocks_per_pass {
            match self.index_next().await? {
                BlockOutcome::Indexed(block) => {
                    report.indexed += 1;
                    report.skipped += block.skipped as u64;
                    report.events += block.events;
                }
                BlockOutcome::Reverted(event) => {
                    report.reverted += event.depth;
                    self.set_state(IndexerState::Indexing).await;
                }
                BlockOutcome::RetryLater { .. } => {
                    report.stalled = true;
                    break;
                }
                BlockOutcome::AlreadyIndexed { .. } | BlockOutcome::CaughtUp => break,
            }
        }

        let mut conn = self.acquire().await?;
        report.head = blocks::current_block(&mut conn).await?.map(|b| b.number);
        Ok(())
    }

    /// One step: recover from a fork, or index the block after the local head.
    pub async fn index_next(&self) -> Result<BlockOutcome, IndexerError> {
        let head = {
            let mut conn = self.acquire().await?;
            blocks::current_block(&mut conn).await?
        };
        let next_number = head.as_ref().map_or(self.config.start_block, |h| h.number + 1);
        let next = self.source.block(next_number).await?;

        if let Some(head) = head {
            let canonical = self.source.block(head.number).await?.map(|b| b.summary());
            let next_summary = next.as_ref().map(ChainBlock::summary);
            if let ForkCheck::Fork(kind) =
                self.detector
                    .check(Some(&head.summary()), canonical.as_ref(), next_summary.as_ref())
            {
                return self.recover(head, kind).await.map(BlockOutcome::Reverted);
            }
        }

        match next {
            Some(block) => self.index_block(&block).await,
            None => Ok(BlockOutcome::CaughtUp),
        }
    }

    /// Revert orphaned head blocks until the head is canonical again.
    async fn recover(&self, head: IndexedBlock, kind: ReorgType) -> Result<ReorgEvent, IndexerError> {
        self.set_state(IndexerState::ReorgRecovery).await;
        let detected_at = head.number;
        let mut reverted: Vec<BlockSummary> = Vec::new();
        let mut current = Some(head);

        while let Some(head) = current.take() {
            let canonical = self.source.block(head.number).await?.map(|b| b.summary());
            let next = self.source.block(head.number + 1).await?.map(|b| b.summary());
            let check = self
                .detector
                .check(Some(&head.summary()), canonical.as_ref(), next.as_ref());
            if !matches!(check, ForkCheck::Fork(_)) {
                break;
            }

            let depth = reverted.len() as u64 + 1;
            if self.detector.exceeds(depth) {
                return Err(IndexerError::Aborted {
                    reason: format!(
                        "reorg at block {detected_at} is deeper than {} blocks",
                        self.detector.max_depth()
                    ),
                });
            }

            let mut tx = self.storage.begin().await?;
            let report = revert::revert_block(&mut tx, &head.blockhash).await?;
            tx.commit()
                .await
                .map_err(|e| IndexerError::Storage(e.to_string()))?;

            let Some(report) = report else {
                break;
            };
            reverted.push(head.summary());
            current = report.new_head;
        }

        let depth = reverted.len() as u64;
        tracing::info!(
            detected_at,
            depth,
            reorg_type = %kind,
            "Reorg recovered"
        );
        Ok(ReorgEvent {
            detected_at,
            reverted_blocks: reverted,
            depth,
            reorg_type: kind,
        })
    }

    /// Index `block` on top of the local head.
    ///
    /// A block at or below the checkpoint is `AlreadyIndexed`; a block that
    /// does not extend the head is a `ReorgDetected` error.
    pub async fn index_block(&self, block: &ChainBlock) -> Result<BlockOutcome, IndexerError> {
        let (head, stored) = {
            let mut conn = self.acquire().await?;
            (
                blocks::current_block(&mut conn).await?,
                checkpoint::load(&mut conn, ENTITY_MANAGER_STREAM).await?,
            )
        };

        if let Some(stored) = stored {
            if block.number <= stored.last_checkpoint {
                tracing::debug!(
                    block = block.number,
                    checkpoint = stored.last_checkpoint,
                    "Block already indexed"
                );
                return Ok(BlockOutcome::AlreadyIndexed { number: block.number });
            }
        }
        match head {
            Some(head) if !block.summary().extends(&head.summary()) => {
                return Err(IndexerError::ReorgDetected {
                    block_number: block.number,
                    expected: head.blockhash,
                    actual: block.parent_hash.clone(),
                });
            }
            None if block.number < self.config.start_block => {
                return Err(IndexerError::Source(format!(
                    "block {} is below start block {}",
                    block.number, self.config.start_block
                )));
            }
            _ => {}
        }

        self.apply_block(block).await
    }

    async fn apply_block(&self, block: &ChainBlock) -> Result<BlockOutcome, IndexerError> {
        let block_ref = block.block_ref();
        let txs = self.sorter.sorted(block.number, &block.transactions);
        let mut queue = ChallengeEventQueue::for_block(&block.hash);
        let mut applied = 0;
        let mut skip_count = 0;

        let mut tx = self.storage.begin().await?;
        for chain_tx in &txs {
            match self.apply_tx(&mut tx, block, chain_tx).await {
                Ok(effects) => {
                    for write in &effects.writes {
                        versions::apply_transaction(&mut tx, write, &block_ref, &chain_tx.tx_hash).await?;
                    }
                    for e in effects.events {
                        queue.enqueue(e.event, block.number, e.user_id, e.extra);
                    }
                    skipped::clear_node_skip(&mut tx, &block.hash, &chain_tx.tx_hash).await?;
                    applied += 1;
                }
                Err(TxError::Invalid(reason)) => {
                    skipped::record_skipped(
                        &mut tx,
                        block.number,
                        &block.hash,
                        &chain_tx.tx_hash,
                        SkipLevel::Network,
                        &reason,
                    )
                    .await?;
                    skip_count += 1;
                }
                Err(TxError::Transient(reason)) => {
                    let prior = skipped::attempts(&mut tx, &block.hash, &chain_tx.tx_hash).await?;
                    if prior + 1 >= self.config.node_skip_retry_limit {
                        skipped::record_skipped(
                            &mut tx,
                            block.number,
                            &block.hash,
                            &chain_tx.tx_hash,
                            SkipLevel::Node,
                            &reason,
                        )
                        .await?;
                        skip_count += 1;
                        continue;
                    }

                    tx.rollback()
                        .await
                        .map_err(|e| IndexerError::Storage(e.to_string()))?;
                    let attempts = {
                        let mut conn = self.acquire().await?;
                        skipped::record_skipped(
                            &mut conn,
                            block.number,
                            &block.hash,
                            &chain_tx.tx_hash,
                            SkipLevel::Node,
                            &format!("will retry: {reason}"),
                        )
                        .await?
                    };
                    tracing::warn!(
                        block = block.number,
                        tx = %chain_tx.tx_hash,
                        attempts,
                        limit = self.config.node_skip_retry_limit,
                        "Block rolled back after transient failure"
                    );
                    return Ok(BlockOutcome::RetryLater {
                        number: block.number,
                        tx_hash: chain_tx.tx_hash.clone(),
                        attempts,
                    });
                }
                Err(TxError::Fatal(e)) => return Err(e),
            }
        }

        let queued = queue.len();
        let events = queue.flush(&self.bus, &mut tx).await?;
        blocks::insert_current_block(&mut tx, block).await?;
        checkpoint::advance_checkpoint(&mut tx, ENTITY_MANAGER_STREAM, block.number).await?;
        tx.commit()
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        tracing::info!(
            block = block.number,
            hash = %block.hash,
            txs = txs.len(),
            applied,
            skipped = skip_count,
            queued,
            events,
            "Block indexed"
        );
        Ok(BlockOutcome::Indexed(CommittedBlock {
            number: block.number,
            blockhash: block.hash.clone(),
            applied,
            skipped: skip_count,
            events,
        }))
    }

    async fn apply_tx(
        &self,
        conn: &mut SqliteConnection,
        block: &ChainBlock,
        chain_tx: &ChainTransaction,
    ) -> Result<TxEffects, TxError> {
        let mut ctx = TxContext {
            conn,
            config: &self.config,
            metadata: self.metadata.as_ref(),
            block_number: block.number,
            blockhash: &block.hash,
            tx_hash: &chain_tx.tx_hash,
        };
        self.handlers.dispatch(&mut ctx, &chain_tx.payload).await
    }
}
