//! Commands that move state forward (or back).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use chainview_challenges::seed_challenges;
use chainview_core::lease::{Lease, MemoryLease};
use chainview_indexer::{BlockIndexJob, BlockIndexer, ChallengeJob, MemoryChain, MemoryMetadataStore, PeriodicWorker};
use chainview_storage::{revert, RedisLease};

use crate::App;

pub async fn init(app: &App) -> Result<()> {
    let seeded = seed_all(app).await?;
    println!("Database ready, {seeded} challenges seeded");
    Ok(())
}

pub async fn seed(app: &App) -> Result<()> {
    let seeded = seed_all(app).await?;
    println!("{seeded} challenges seeded");
    Ok(())
}

async fn seed_all(app: &App) -> Result<usize> {
    // Reject broken prerequisite chains before touching the database.
    app.registry()?;
    let mut conn = app.storage.pool().acquire().await?;
    Ok(seed_challenges(&mut conn, &app.definitions).await?)
}

fn indexer(app: &App, blocks: &Path) -> Result<(Arc<BlockIndexer>, Arc<chainview_challenges::ChallengeEventBus>)> {
    let chain = MemoryChain::from_file(blocks).with_context(|| format!("loading blocks {}", blocks.display()))?;
    let bus = app.bus()?;
    let indexer = BlockIndexer::new(
        app.config.clone(),
        app.storage.clone(),
        Arc::new(chain),
        Arc::new(MemoryMetadataStore::new()),
        bus.clone(),
    );
    Ok((Arc::new(indexer), bus))
}

pub async fn replay(app: &App, blocks: &Path, process: bool) -> Result<()> {
    let (indexer, bus) = indexer(app, blocks)?;

    let (mut indexed, mut reverted, mut skipped, mut events) = (0, 0, 0, 0);
    let mut head = None;
    loop {
        let report = indexer.run_pass().await?;
        indexed += report.indexed;
        reverted += report.reverted;
        skipped += report.skipped;
        events += report.events;
        head = report.head.or(head);
        // A stalled pass makes progress on the retry counter, so keep going.
        if report.indexed == 0 && report.reverted == 0 && !report.stalled {
            break;
        }
    }
    println!("Indexed {indexed} blocks, reverted {reverted}, skipped {skipped} txs, dispatched {events} events");
    match head {
        Some(head) => println!("Head: {head}"),
        None => println!("Head: none"),
    }

    if process {
        let mut processed = 0;
        loop {
            let summary = bus.process_events(app.storage.pool()).await?;
            processed += summary.count;
            if summary.did_error {
                eprintln!("warning: some challenge managers failed, see logs");
            }
            if summary.count == 0 {
                break;
            }
        }
        println!("Processed {processed} challenge events");
    }
    Ok(())
}

pub async fn run(app: &App, blocks: &Path, redis_url: Option<&str>, holder: &str) -> Result<()> {
    let (indexer, bus) = indexer(app, blocks)?;
    let lease: Arc<dyn Lease> = match redis_url {
        Some(url) => Arc::new(RedisLease::connect(url).await.context("connecting to redis")?),
        None => Arc::new(MemoryLease::new()),
    };
    let ttl = Duration::from_secs(app.config.lock_ttl_secs);

    let block_worker = PeriodicWorker::new(Arc::new(BlockIndexJob::new(indexer)), lease.clone(), holder)
        .interval(Duration::from_millis(app.config.poll_interval_ms))
        .ttl(ttl);
    let challenge_worker = PeriodicWorker::new(
        Arc::new(ChallengeJob::new(bus, app.storage.pool().clone())),
        lease,
        holder,
    )
    .interval(Duration::from_millis(app.config.challenge_poll_interval_ms))
    .ttl(ttl);

    let (shutdown, rx) = watch::channel(false);
    let blocks_task = tokio::spawn(block_worker.run(rx.clone()));
    let challenges_task = tokio::spawn(challenge_worker.run(rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.send(true)?;
    blocks_task.await?;
    challenges_task.await?;
    Ok(())
}

pub async fn process_events(app: &App, drain: bool) -> Result<()> {
    let bus = app.bus()?;
    let mut total = 0;
    let mut errored = false;
    loop {
        let summary = bus.process_events(app.storage.pool()).await?;
        total += summary.count;
        errored |= summary.did_error;
        if !drain || summary.count == 0 {
            break;
        }
    }
    println!("Processed {total} events{}", if errored { " (with errors)" } else { "" });
    Ok(())
}

pub async fn revert(app: &App, to: u64) -> Result<()> {
    let mut tx = app.storage.begin().await?;
    let reports = revert::revert_from(&mut tx, to).await?;
    tx.commit().await?;

    for r in &reports {
        println!(
            "Reverted block {} ({}): {} rows removed, {} restored, {} events purged",
            r.blocknumber, r.blockhash, r.reverted, r.restored, r.purged_events
        );
    }
    if reports.is_empty() {
        println!("Nothing to revert");
    }
    Ok(())
}
