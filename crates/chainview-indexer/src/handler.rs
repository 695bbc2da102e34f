//! Entity handler trait and the `(entity_type, action)` routing table.
//!
//! A handler validates one decoded transaction against the current entity
//! state and returns the writes and challenge events it implies. Handlers never
//! write themselves: the block pass applies the writes, so a rejected
//! transaction leaves no trace beyond its skip record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::config::IndexerConfig;
use chainview_core::entity::{Action, EntityType, EntityVersion, EntityWrite, ManageEntity};
use chainview_core::error::TxError;
use chainview_storage::versions;

use crate::entities::{ContentHandler, SocialHandler, UserHandler};
use crate::metadata::MetadataResolver;

// ─── Context ──────────────────────────────────────────────────────────────────

/// Everything a handler may read while validating one transaction.
pub struct TxContext<'a> {
    /// The open block transaction. Earlier transactions of the block are visible.
    pub conn: &'a mut SqliteConnection,
    pub config: &'a IndexerConfig,
    pub metadata: &'a dyn MetadataResolver,
    pub block_number: u64,
    pub blockhash: &'a str,
    pub tx_hash: &'a str,
}

impl<'a> TxContext<'a> {
    /// Current version of a key, including deletes.
    pub async fn current(&mut self, entity_type: EntityType, key: &str) -> Result<Option<EntityVersion>, TxError> {
        Ok(versions::current(self.conn, entity_type, key).await?)
    }

    pub async fn live(&mut self, entity_type: EntityType, key: &str) -> Result<Option<EntityVersion>, TxError> {
        Ok(versions::live(self.conn, entity_type, key).await?)
    }

    /// Live version of a key, or a network-level rejection naming it.
    pub async fn require_live(&mut self, entity_type: EntityType, id: u64) -> Result<EntityVersion, TxError> {
        self.live(entity_type, &id.to_string())
            .await?
            .ok_or_else(|| TxError::invalid(format!("{entity_type} {id} does not exist")))
    }

    /// Inline metadata, or the document behind `metadata.cid`.
    pub async fn resolve_metadata(
        &mut self,
        tx: &ManageEntity,
    ) -> Result<serde_json::Map<String, serde_json::Value>, TxError> {
        let Some(cid) = tx.metadata_cid() else {
            return Ok(tx.metadata_object());
        };
        match self.metadata.resolve(cid).await {
            Ok(serde_json::Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(TxError::invalid(format!("metadata {cid} is not an object"))),
            Err(reason) => Err(TxError::Transient(reason)),
        }
    }
}

// ─── Effects ──────────────────────────────────────────────────────────────────

/// A challenge event implied by a transaction. The block number is filled in
/// by the block pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub event: ChallengeEvent,
    pub user_id: u64,
    pub extra: serde_json::Value,
}

/// What one accepted transaction does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxEffects {
    pub writes: Vec<EntityWrite>,
    pub events: Vec<EmittedEvent>,
}

impl TxEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, write: EntityWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn emit(mut self, event: ChallengeEvent, user_id: u64, extra: serde_json::Value) -> Self {
        self.events.push(EmittedEvent { event, user_id, extra });
        self
    }
}

// ─── Handler trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait EntityHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// The `(entity_type, action)` pairs this handler accepts.
    fn routes(&self) -> Vec<(EntityType, Action)>;

    /// Validate `tx` and return its effects.
    ///
    /// Deterministic rejections are `TxError::Invalid`; failures of auxiliary
    /// collaborators are `TxError::Transient`.
    async fn handle(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError>;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Routing table from `(entity_type, action)` to a handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<(EntityType, Action), Arc<dyn EntityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the user, content and social handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UserHandler));
        registry.register(Arc::new(ContentHandler::tracks()));
        registry.register(Arc::new(ContentHandler::playlists()));
        registry.register(Arc::new(SocialHandler));
        registry
    }

    /// Route every pair `handler` declares to it. Later registrations win.
    pub fn register(&mut self, handler: Arc<dyn EntityHandler>) {
        for route in handler.routes() {
            self.routes.insert(route, Arc::clone(&handler));
        }
    }

    pub fn route(&self, entity_type: EntityType, action: Action) -> Option<&Arc<dyn EntityHandler>> {
        self.routes.get(&(entity_type, action))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decode `payload` and run it through its handler.
    pub async fn dispatch(&self, ctx: &mut TxContext<'_>, payload: &serde_json::Value) -> Result<TxEffects, TxError> {
        let tx = ManageEntity::parse(payload)?;
        let handler = self
            .route(tx.entity_type, tx.action)
            .ok_or_else(|| TxError::invalid(format!("no handler for {} {}", tx.entity_type, tx.action)))?;
        tracing::debug!(
            handler = handler.name(),
            entity_type = %tx.entity_type,
            action = %tx.action,
            entity_id = tx.entity_id,
            signer = tx.user_id,
            "handling transaction"
        );
        handler.handle(ctx, &tx).await
    }
}

/// Overlay `updates` on an existing field object.
pub(crate) fn merge_fields(
    base: &serde_json::Value,
    updates: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let mut merged = match base {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (k, v) in updates {
        merged.insert(k, v);
    }
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use chainview_storage::SqliteStorage;
    use serde_json::json;

    #[test]
    fn defaults_cover_every_documented_route() {
        let registry = HandlerRegistry::with_defaults();
        for (t, a) in [
            (EntityType::User, Action::Create),
            (EntityType::User, Action::Tip),
            (EntityType::User, Action::Follow),
            (EntityType::Track, Action::Listen),
            (EntityType::Playlist, Action::Delete),
            (EntityType::Playlist, Action::Unrepost),
        ] {
            assert!(registry.route(t, a).is_some(), "{t} {a}");
        }
        assert!(registry.route(EntityType::Playlist, Action::Listen).is_none());
    }

    #[test]
    fn merge_overlays_fields() {
        let mut updates = serde_json::Map::new();
        updates.insert("name".into(), json!("b"));
        let merged = merge_fields(&json!({"name": "a", "bio": "x"}), updates);
        assert_eq!(merged, json!({"name": "b", "bio": "x"}));
    }

    #[tokio::test]
    async fn unknown_route_and_bad_payload_are_invalid() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        let mut ctx = TxContext {
            conn: &mut conn,
            config: &config,
            metadata: &metadata,
            block_number: 1,
            blockhash: "0x1",
            tx_hash: "0xa",
        };
        let registry = HandlerRegistry::with_defaults();

        let err = registry
            .dispatch(&mut ctx, &json!({"entity_type": "Playlist", "entity_id": 1, "action": "Listen", "user_id": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Invalid(_)));

        let err = registry.dispatch(&mut ctx, &json!({"action": "Create"})).await.unwrap_err();
        assert!(matches!(err, TxError::Invalid(_)));
    }

    #[tokio::test]
    async fn cid_failure_is_transient() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        let mut ctx = TxContext {
            conn: &mut conn,
            config: &config,
            metadata: &metadata,
            block_number: 1,
            blockhash: "0x1",
            tx_hash: "0xa",
        };
        let tx = ManageEntity::parse(&json!({
            "entity_type": "User", "entity_id": 1, "action": "Create", "user_id": 1,
            "metadata": {"cid": "QmMissing"}
        }))
        .unwrap();
        assert!(matches!(ctx.resolve_metadata(&tx).await, Err(TxError::Transient(_))));
    }
}
