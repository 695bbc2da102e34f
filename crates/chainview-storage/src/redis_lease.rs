//! Redis-backed lease for multi-process deployments.
//!
//! Acquire is `SET key holder NX PX ttl`. Release deletes the key only while it
//! still holds our holder id, so a holder whose TTL expired cannot release a
//! lease someone else has since taken.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, error};

use chainview_core::error::IndexerError;
use chainview_core::lease::Lease;

/// Key prefix for lease names.
pub const KEY_PREFIX: &str = "chainview:lease";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLease {
    redis: ConnectionManager,
}

impl RedisLease {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, IndexerError> {
        let client = redis::Client::open(url).map_err(|e| IndexerError::Config(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| IndexerError::Storage(format!("redis connect: {e}")))?;
        Ok(Self::new(redis))
    }

    fn key(name: &str) -> String {
        format!("{KEY_PREFIX}:{name}")
    }
}

#[async_trait]
impl Lease for RedisLease {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, IndexerError> {
        let key = Self::key(name);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.redis.clone())
            .await
            .map_err(|e| {
                error!(key = %key, "Redis error acquiring lease: {}", e);
                IndexerError::Storage(e.to_string())
            })?;
        let acquired = reply.is_some();
        debug!(key = %key, holder, acquired, "lease acquire");
        Ok(acquired)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, IndexerError> {
        let key = Self::key(name);
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(holder)
            .invoke_async(&mut self.redis.clone())
            .await
            .map_err(|e| {
                error!(key = %key, "Redis error releasing lease: {}", e);
                IndexerError::Storage(e.to_string())
            })?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(RedisLease::key("index_blocks"), "chainview:lease:index_blocks");
    }
}
