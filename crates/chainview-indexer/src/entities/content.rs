use async_trait::async_trait;
use serde_json::json;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::entity::{Action, EntityType, EntityVersion, EntityWrite, ManageEntity};
use chainview_core::error::TxError;

use crate::handler::{merge_fields, EntityHandler, TxContext, TxEffects};

/// Tracks and playlists: owned content with create, update and delete.
/// Tracks also accept listens.
#[derive(Debug, Clone, Copy)]
pub struct ContentHandler {
    entity_type: EntityType,
}

impl ContentHandler {
    pub fn tracks() -> Self {
        Self {
            entity_type: EntityType::Track,
        }
    }

    pub fn playlists() -> Self {
        Self {
            entity_type: EntityType::Playlist,
        }
    }

    fn id_field(&self) -> &'static str {
        match self.entity_type {
            EntityType::Playlist => "playlist_id",
            _ => "track_id",
        }
    }

    async fn owned(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<EntityVersion, TxError> {
        let existing = ctx.require_live(self.entity_type, tx.entity_id).await?;
        if existing.field_u64("owner_id") != Some(tx.user_id) {
            return Err(TxError::invalid(format!(
                "user {} does not own {} {}",
                tx.user_id, self.entity_type, tx.entity_id
            )));
        }
        Ok(existing)
    }

    async fn create(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        let key = tx.entity_id.to_string();
        // Ids are never reused, not even after a delete.
        if ctx.current(self.entity_type, &key).await?.is_some() {
            return Err(TxError::invalid(format!("{} {key} already exists", self.entity_type)));
        }
        ctx.require_live(EntityType::User, tx.user_id).await?;

        let mut fields = ctx.resolve_metadata(tx).await?;
        fields.remove("cid");
        fields.insert(self.id_field().into(), json!(tx.entity_id));
        fields.insert("owner_id".into(), json!(tx.user_id));

        let event = match self.entity_type {
            EntityType::Playlist => ChallengeEvent::FirstPlaylist,
            _ => ChallengeEvent::TrackUpload,
        };
        let mut extra = serde_json::Map::new();
        extra.insert(self.id_field().into(), json!(tx.entity_id));
        Ok(TxEffects::new()
            .write(EntityWrite::upsert(self.entity_type, key, serde_json::Value::Object(fields)))
            .emit(event, tx.user_id, serde_json::Value::Object(extra)))
    }

    async fn update(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        let existing = self.owned(ctx, tx).await?;
        let mut updates = ctx.resolve_metadata(tx).await?;
        for field in ["cid", "owner_id", self.id_field()] {
            updates.remove(field);
        }
        Ok(TxEffects::new().write(EntityWrite::upsert(
            self.entity_type,
            tx.entity_id.to_string(),
            merge_fields(&existing.fields, updates),
        )))
    }

    async fn delete(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        let existing = self.owned(ctx, tx).await?;
        Ok(TxEffects::new().write(EntityWrite::delete(
            self.entity_type,
            tx.entity_id.to_string(),
            existing.fields,
        )))
    }

    async fn listen(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        let track = ctx.require_live(EntityType::Track, tx.entity_id).await?;
        ctx.require_live(EntityType::User, tx.user_id).await?;
        let owner = track
            .field_u64("owner_id")
            .ok_or_else(|| TxError::invalid(format!("track {} has no owner", tx.entity_id)))?;
        Ok(TxEffects::new().emit(
            ChallengeEvent::TrackListen,
            owner,
            json!({ "track_id": tx.entity_id, "listener_id": tx.user_id }),
        ))
    }
}

#[async_trait]
impl EntityHandler for ContentHandler {
    fn name(&self) -> &'static str {
        match self.entity_type {
            EntityType::Playlist => "playlist",
            _ => "track",
        }
    }

    fn routes(&self) -> Vec<(EntityType, Action)> {
        let mut actions = vec![Action::Create, Action::Update, Action::Delete];
        if self.entity_type == EntityType::Track {
            actions.push(Action::Listen);
        }
        actions.into_iter().map(|a| (self.entity_type, a)).collect()
    }

    async fn handle(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        match tx.action {
            Action::Create => self.create(ctx, tx).await,
            Action::Update => self.update(ctx, tx).await,
            Action::Delete => self.delete(ctx, tx).await,
            Action::Listen if self.entity_type == EntityType::Track => self.listen(ctx, tx).await,
            other => Err(TxError::invalid(format!("{} does not support {other}", self.entity_type))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::testing::{run, seed_user};
    use crate::metadata::MemoryMetadataStore;
    use chainview_core::config::IndexerConfig;
    use chainview_storage::{versions, SqliteStorage};

    fn tx(entity_type: &str, action: &str, id: u64, signer: u64, metadata: serde_json::Value) -> serde_json::Value {
        json!({
            "entity_type": entity_type,
            "entity_id": id,
            "action": action,
            "user_id": signer,
            "metadata": metadata,
        })
    }

    #[tokio::test]
    async fn track_lifecycle() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 7, json!({"user_id": 7})).await;
        seed_user(&mut conn, 8, json!({"user_id": 8})).await;

        let created = run(&mut conn, &config, &metadata, tx("Track", "Create", 12, 7, json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(created.events[0].event, ChallengeEvent::TrackUpload);
        assert_eq!(created.events[0].extra["track_id"], 12);

        // Only the owner may update or delete.
        let err = run(&mut conn, &config, &metadata, tx("Track", "Update", 12, 8, json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Invalid(_)));

        run(&mut conn, &config, &metadata, tx("Track", "Update", 12, 7, json!({"title": "b", "owner_id": 8})))
            .await
            .unwrap();
        let track = versions::live(&mut conn, EntityType::Track, "12").await.unwrap().unwrap();
        assert_eq!(track.fields["title"], "b");
        assert_eq!(track.field_u64("owner_id"), Some(7));

        run(&mut conn, &config, &metadata, tx("Track", "Delete", 12, 7, json!(null)))
            .await
            .unwrap();
        assert!(versions::live(&mut conn, EntityType::Track, "12").await.unwrap().is_none());

        let err = run(&mut conn, &config, &metadata, tx("Track", "Create", 12, 7, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Invalid(_)));
    }

    #[tokio::test]
    async fn listen_credits_the_owner() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 7, json!({"user_id": 7})).await;
        seed_user(&mut conn, 8, json!({"user_id": 8})).await;
        run(&mut conn, &config, &metadata, tx("Track", "Create", 12, 7, json!({})))
            .await
            .unwrap();

        let effects = run(&mut conn, &config, &metadata, tx("Track", "Listen", 12, 8, json!(null)))
            .await
            .unwrap();
        assert_eq!(effects.events[0].event, ChallengeEvent::TrackListen);
        assert_eq!(effects.events[0].user_id, 7);
        assert_eq!(effects.events[0].extra["listener_id"], 8);
    }

    #[tokio::test]
    async fn playlist_create_from_cid() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        metadata.insert("QmP", json!({"name": "mix"})).await;
        seed_user(&mut conn, 7, json!({"user_id": 7})).await;

        let effects = run(&mut conn, &config, &metadata, tx("Playlist", "Create", 3, 7, json!({"cid": "QmP"})))
            .await
            .unwrap();
        assert_eq!(effects.events[0].event, ChallengeEvent::FirstPlaylist);
        let playlist = versions::live(&mut conn, EntityType::Playlist, "3").await.unwrap().unwrap();
        assert_eq!(playlist.fields["name"], "mix");
        assert!(playlist.fields.get("cid").is_none());
    }
}
