//! Read-only views, plus recording payouts.

use anyhow::Result;
use serde::Serialize;

use chainview_challenges::{challenge_summaries, DisbursementLedger};
use chainview_core::checkpoint::CHALLENGE_EVENTS_STREAM;
use chainview_storage::{blocks, challenges, checkpoint, revert, skipped, versions, SkipLevel};

use crate::App;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn status(app: &App) -> Result<()> {
    let mut conn = app.storage.pool().acquire().await?;

    match blocks::current_block(&mut conn).await? {
        Some(head) => println!("Head:        {} ({})", head.number, head.blockhash),
        None => println!("Head:        none"),
    }
    println!("Blocks:      {}", blocks::block_count(&mut conn).await?);
    println!("Versions:    {}", versions::version_count(&mut conn).await?);

    println!("Checkpoints:");
    for cp in checkpoint::all(&mut conn).await? {
        println!("  {:<18} {:>10}  {}", cp.stream, cp.last_checkpoint, cp.updated_at.to_rfc3339());
    }

    let marker = checkpoint::last_checkpoint(&mut conn, CHALLENGE_EVENTS_STREAM).await?;
    println!("Pending challenge events: {}", challenges::pending_event_count(&mut conn, marker).await?);

    let skips = skipped::list(&mut conn, None).await?;
    let node = skips.iter().filter(|s| s.level == SkipLevel::Node).count();
    println!("Skipped txs: {} network, {} node", skips.len() - node, node);
    Ok(())
}

pub async fn skipped(app: &App, level: Option<SkipLevel>) -> Result<()> {
    let mut conn = app.storage.pool().acquire().await?;
    print_json(&skipped::list(&mut conn, level).await?)
}

pub async fn reverts(app: &App, block: Option<u64>) -> Result<()> {
    let mut conn = app.storage.pool().acquire().await?;
    print_json(&revert::revert_log(&mut conn, block).await?)
}

pub async fn user_challenges(app: &App, user: u64) -> Result<()> {
    let registry = app.registry()?;
    let mut conn = app.storage.pool().acquire().await?;
    print_json(&challenge_summaries(&mut conn, &registry, user).await?)
}

pub async fn eligible(app: &App, limit: u32) -> Result<()> {
    let mut conn = app.storage.pool().acquire().await?;
    print_json(&DisbursementLedger::new().eligible(&mut conn, limit).await?)
}

pub async fn disburse(app: &App, challenge: &str, specifier: &str, signature: &str, slot: u64) -> Result<()> {
    let mut conn = app.storage.pool().acquire().await?;
    let disbursement = DisbursementLedger::new()
        .record(&mut conn, challenge, specifier, signature, slot)
        .await?;
    print_json(&disbursement)
}
