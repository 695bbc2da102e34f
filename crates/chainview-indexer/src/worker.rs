//! Periodic, lease-guarded workers.
//!
//! Each tick tries the job's lease without waiting. If another holder has it,
//! the tick is skipped; otherwise the job runs once and the lease is released.
//! Missed ticks are skipped rather than bunched up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use chainview_challenges::ChallengeEventBus;
use chainview_core::error::IndexerError;
use chainview_core::lease::Lease;

use crate::pass::BlockIndexer;

/// Lease name of the block indexer.
pub const INDEX_BLOCKS_JOB: &str = "index_blocks";
/// Lease name of the challenge processor.
pub const INDEX_CHALLENGES_JOB: &str = "index_challenges";

#[async_trait]
pub trait Job: Send + Sync {
    /// Lease name; at most one holder runs a job with this name at a time.
    fn name(&self) -> &str;

    async fn run_once(&self) -> Result<(), IndexerError>;
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    /// Someone else holds the lease.
    Skipped,
}

pub struct PeriodicWorker {
    job: Arc<dyn Job>,
    lease: Arc<dyn Lease>,
    holder: String,
    interval: Duration,
    ttl: Duration,
}

impl PeriodicWorker {
    pub fn new(job: Arc<dyn Job>, lease: Arc<dyn Lease>, holder: impl Into<String>) -> Self {
        Self {
            job,
            lease,
            holder: holder.into(),
            interval: Duration::from_secs(1),
            ttl: Duration::from_secs(600),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Run the job once if the lease is free.
    pub async fn tick(&self) -> Result<TickOutcome, IndexerError> {
        let name = self.job.name();
        if !self.lease.try_acquire(name, &self.holder, self.ttl).await? {
            tracing::debug!(job = name, holder = %self.holder, "Lease held elsewhere, skipping tick");
            return Ok(TickOutcome::Skipped);
        }

        let result = self.job.run_once().await;
        if let Err(e) = self.lease.release(name, &self.holder).await {
            tracing::warn!(job = name, error = %e, "Failed to release lease");
        }
        result.map(|()| TickOutcome::Ran)
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(job = self.job.name(), every_ms = self.interval.as_millis() as u64, "Worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(job = self.job.name(), error = %e, retryable = e.is_retryable(), "Job failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(job = self.job.name(), "Worker stopped");
    }
}

// ─── Jobs ─────────────────────────────────────────────────────────────────────

/// Runs one block pass per tick.
pub struct BlockIndexJob {
    indexer: Arc<BlockIndexer>,
}

impl BlockIndexJob {
    pub fn new(indexer: Arc<BlockIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl Job for BlockIndexJob {
    fn name(&self) -> &str {
        INDEX_BLOCKS_JOB
    }

    async fn run_once(&self) -> Result<(), IndexerError> {
        self.indexer.run_pass().await.map(|_| ())
    }
}

/// Processes one batch of challenge events per tick.
pub struct ChallengeJob {
    bus: Arc<ChallengeEventBus>,
    pool: SqlitePool,
}

impl ChallengeJob {
    pub fn new(bus: Arc<ChallengeEventBus>, pool: SqlitePool) -> Self {
        Self { bus, pool }
    }
}

#[async_trait]
impl Job for ChallengeJob {
    fn name(&self) -> &str {
        INDEX_CHALLENGES_JOB
    }

    async fn run_once(&self) -> Result<(), IndexerError> {
        let summary = self.bus.process_events(&self.pool).await?;
        if summary.did_error {
            tracing::warn!(count = summary.count, "Challenge batch finished with errors");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainview_core::lease::MemoryLease;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        runs: AtomicU32,
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run_once(&self) -> Result<(), IndexerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_skips_when_lease_is_held() {
        let lease = Arc::new(MemoryLease::new());
        let job = Arc::new(Counter { runs: AtomicU32::new(0) });
        let worker = PeriodicWorker::new(job.clone(), lease.clone(), "node-a");

        lease.try_acquire("counter", "node-b", Duration::from_secs(60)).await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        lease.release("counter", "node-b").await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Ran);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        // Released after the run.
        assert!(lease.holder("counter").await.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let lease = Arc::new(MemoryLease::new());
        let job = Arc::new(Counter { runs: AtomicU32::new(0) });
        let worker = PeriodicWorker::new(job.clone(), lease, "node-a").interval(Duration::from_millis(5));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(job.runs.load(Ordering::SeqCst) >= 1);
    }
}
