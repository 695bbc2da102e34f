//! Named, TTL-bounded, non-blocking leases.
//!
//! A periodic job takes the lease for its name before running. If another
//! holder has it the tick is skipped. The TTL bounds how long a crashed holder
//! can block others.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::IndexerError;

/// Lease backend.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Try to take `name` for `holder`. Returns `false` if someone else holds it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<bool, IndexerError>;

    /// Release `name` if `holder` still owns it. Returns `true` if released.
    async fn release(&self, name: &str, holder: &str) -> Result<bool, IndexerError>;
}

// ─── In-memory lease ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Held {
    holder: String,
    expires_at: Instant,
}

/// Single-process lease for tests and one-node deployments.
#[derive(Default)]
pub struct MemoryLease {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, ignoring expired entries.
    pub async fn holder(&self, name: &str) -> Option<String> {
        let held = self.held.lock().await;
        held.get(name)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.holder.clone())
    }
}

#[async_trait]
impl Lease for MemoryLease {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, IndexerError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some(current) = held.get(name) {
            if current.expires_at > now {
                return Ok(false);
            }
        }
        held.insert(
            name.to_string(),
            Held {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, IndexerError> {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some(current) if current.holder == holder => {
                held.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
