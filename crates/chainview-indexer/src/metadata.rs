//! Off-chain metadata resolution.
//!
//! Entity payloads may carry `metadata.cid` instead of inline metadata. A
//! resolver failure is never a verdict on the transaction: it is node-local and
//! the transaction is retried on a later pass.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Fetch the JSON document for `cid`. `Err` carries the failure reason.
    async fn resolve(&self, cid: &str) -> Result<serde_json::Value, String>;
}

/// In-memory documents with injectable failures.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    docs: RwLock<HashMap<String, serde_json::Value>>,
    failures: RwLock<HashMap<String, u32>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, cid: impl Into<String>, doc: serde_json::Value) {
        self.docs.write().await.insert(cid.into(), doc);
    }

    /// Make the next `times` lookups of `cid` fail.
    pub async fn fail_times(&self, cid: impl Into<String>, times: u32) {
        self.failures.write().await.insert(cid.into(), times);
    }
}

#[async_trait]
impl MetadataResolver for MemoryMetadataStore {
    async fn resolve(&self, cid: &str) -> Result<serde_json::Value, String> {
        {
            let mut failures = self.failures.write().await;
            if let Some(left) = failures.get_mut(cid) {
                if *left > 0 {
                    *left -= 1;
                    return Err(format!("timed out fetching {cid}"));
                }
            }
        }
        self.docs
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| format!("cid {cid} not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = MemoryMetadataStore::new();
        store.insert("Qm1", json!({"title": "a"})).await;
        store.fail_times("Qm1", 2).await;

        assert!(store.resolve("Qm1").await.is_err());
        assert!(store.resolve("Qm1").await.is_err());
        assert_eq!(store.resolve("Qm1").await.unwrap()["title"], "a");
        assert!(store.resolve("Qm2").await.is_err());
    }
}
