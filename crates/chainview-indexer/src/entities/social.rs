use async_trait::async_trait;
use serde_json::json;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::entity::{follow_key, social_key, Action, EntityType, EntityVersion, EntityWrite, ManageEntity};
use chainview_core::error::TxError;

use crate::handler::{EntityHandler, TxContext, TxEffects};

/// Follows, saves and reposts. Each relation is its own versioned entity.
///
/// Adding or undoing a relation raises the matching challenge event for the
/// signer. Saving or reposting a remix as the artist of its parent track
/// also raises `Cosign` for the remix owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocialHandler;

fn relation_event(kind: EntityType) -> ChallengeEvent {
    match kind {
        EntityType::Follow => ChallengeEvent::Follow,
        EntityType::Save => ChallengeEvent::Favorite,
        _ => ChallengeEvent::Repost,
    }
}

fn relation_extra(kind: EntityType, tx: &ManageEntity, is_delete: bool) -> serde_json::Value {
    match kind {
        EntityType::Follow => json!({ "followee_user_id": tx.entity_id, "is_delete": is_delete }),
        _ => json!({
            "target_type": tx.entity_type.as_str(),
            "target_id": tx.entity_id,
            "is_delete": is_delete,
        }),
    }
}

/// Parent track ids listed under `remix_of.tracks[].parent_track_id`.
fn remix_parents(track: &EntityVersion) -> Vec<u64> {
    track
        .fields
        .pointer("/remix_of/tracks")
        .and_then(|v| v.as_array())
        .map(|parents| {
            parents
                .iter()
                .filter_map(|p| p.get("parent_track_id").and_then(|id| id.as_u64()))
                .collect()
        })
        .unwrap_or_default()
}

impl SocialHandler {
    /// `Cosign` events for `remix` when the signer owns one of its parents.
    async fn cosigns(
        &self,
        ctx: &mut TxContext<'_>,
        tx: &ManageEntity,
        remix: &EntityVersion,
    ) -> Result<Vec<(u64, serde_json::Value)>, TxError> {
        let Some(remixer) = remix.field_u64("owner_id") else {
            return Ok(Vec::new());
        };
        if remixer == tx.user_id {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for parent_id in remix_parents(remix) {
            let Some(parent) = ctx.live(EntityType::Track, &parent_id.to_string()).await? else {
                continue;
            };
            if parent.field_u64("owner_id") == Some(tx.user_id) {
                events.push((
                    remixer,
                    json!({
                        "track_id": tx.entity_id,
                        "parent_track_id": parent_id,
                        "cosigner_user_id": tx.user_id,
                    }),
                ));
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EntityHandler for SocialHandler {
    fn name(&self) -> &'static str {
        "social"
    }

    fn routes(&self) -> Vec<(EntityType, Action)> {
        let mut routes = vec![
            (EntityType::User, Action::Follow),
            (EntityType::User, Action::Unfollow),
        ];
        for target in [EntityType::Track, EntityType::Playlist] {
            for action in [Action::Save, Action::Unsave, Action::Repost, Action::Unrepost] {
                routes.push((target, action));
            }
        }
        routes
    }

    async fn handle(&self, ctx: &mut TxContext<'_>, tx: &ManageEntity) -> Result<TxEffects, TxError> {
        let (kind, key, adding) = match (tx.entity_type, tx.action) {
            (EntityType::User, Action::Follow) => (EntityType::Follow, follow_key(tx.user_id, tx.entity_id), true),
            (EntityType::User, Action::Unfollow) => (EntityType::Follow, follow_key(tx.user_id, tx.entity_id), false),
            (target, Action::Save) => (EntityType::Save, social_key(tx.user_id, target, tx.entity_id), true),
            (target, Action::Unsave) => (EntityType::Save, social_key(tx.user_id, target, tx.entity_id), false),
            (target, Action::Repost) => (EntityType::Repost, social_key(tx.user_id, target, tx.entity_id), true),
            (target, Action::Unrepost) => (EntityType::Repost, social_key(tx.user_id, target, tx.entity_id), false),
            (t, a) => return Err(TxError::invalid(format!("{t} does not support {a}"))),
        };

        let existing = ctx.live(kind, &key).await?;
        if !adding {
            let existing = existing.ok_or_else(|| TxError::invalid(format!("no {kind} {key} to undo")))?;
            return Ok(TxEffects::new()
                .write(EntityWrite::delete(kind, key, existing.fields))
                .emit(relation_event(kind), tx.user_id, relation_extra(kind, tx, true)));
        }

        if existing.is_some() {
            return Err(TxError::invalid(format!("{kind} {key} already exists")));
        }
        if tx.entity_type == EntityType::User && tx.user_id == tx.entity_id {
            return Err(TxError::invalid(format!("user {} cannot follow themselves", tx.user_id)));
        }
        ctx.require_live(EntityType::User, tx.user_id).await?;
        let target = ctx.require_live(tx.entity_type, tx.entity_id).await?;

        let fields = match kind {
            EntityType::Follow => json!({ "follower_user_id": tx.user_id, "followee_user_id": tx.entity_id }),
            _ => json!({
                "user_id": tx.user_id,
                "target_type": tx.entity_type.as_str(),
                "target_id": tx.entity_id,
            }),
        };
        let mut effects = TxEffects::new()
            .write(EntityWrite::upsert(kind, key, fields))
            .emit(relation_event(kind), tx.user_id, relation_extra(kind, tx, false));
        if tx.entity_type == EntityType::Track {
            for (remixer, extra) in self.cosigns(ctx, tx, &target).await? {
                effects = effects.emit(ChallengeEvent::Cosign, remixer, extra);
            }
        }
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::testing::{run, seed_user};
    use crate::metadata::MemoryMetadataStore;
    use chainview_core::config::IndexerConfig;
    use chainview_storage::{versions, SqliteStorage};

    fn tx(entity_type: &str, action: &str, id: u64, signer: u64) -> serde_json::Value {
        json!({"entity_type": entity_type, "entity_id": id, "action": action, "user_id": signer})
    }

    #[tokio::test]
    async fn follow_then_unfollow() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 1, json!({"user_id": 1})).await;
        seed_user(&mut conn, 2, json!({"user_id": 2})).await;

        run(&mut conn, &config, &metadata, tx("User", "Follow", 2, 1)).await.unwrap();
        assert!(versions::live(&mut conn, EntityType::Follow, "1:2").await.unwrap().is_some());
        assert!(matches!(
            run(&mut conn, &config, &metadata, tx("User", "Follow", 2, 1)).await,
            Err(TxError::Invalid(_))
        ));

        run(&mut conn, &config, &metadata, tx("User", "Unfollow", 2, 1)).await.unwrap();
        assert!(versions::live(&mut conn, EntityType::Follow, "1:2").await.unwrap().is_none());
        assert!(matches!(
            run(&mut conn, &config, &metadata, tx("User", "Unfollow", 2, 1)).await,
            Err(TxError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn self_follow_and_missing_targets_are_rejected() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 1, json!({"user_id": 1})).await;

        for bad in [tx("User", "Follow", 1, 1), tx("User", "Follow", 9, 1), tx("Track", "Save", 5, 1)] {
            assert!(matches!(run(&mut conn, &config, &metadata, bad).await, Err(TxError::Invalid(_))));
        }
    }

    #[tokio::test]
    async fn repost_is_keyed_by_target() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 1, json!({"user_id": 1})).await;
        run(
            &mut conn,
            &config,
            &metadata,
            json!({"entity_type": "Playlist", "entity_id": 4, "action": "Create", "user_id": 1, "metadata": {}}),
        )
        .await
        .unwrap();

        run(&mut conn, &config, &metadata, tx("Playlist", "Repost", 4, 1)).await.unwrap();
        let repost = versions::live(&mut conn, EntityType::Repost, "1:Playlist:4").await.unwrap().unwrap();
        assert_eq!(repost.fields["target_type"], "Playlist");
    }

    fn create_track(id: u64, owner: u64, metadata: serde_json::Value) -> serde_json::Value {
        json!({"entity_type": "Track", "entity_id": id, "action": "Create", "user_id": owner, "metadata": metadata})
    }

    #[tokio::test]
    async fn relations_raise_profile_events_both_ways() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        seed_user(&mut conn, 1, json!({"user_id": 1})).await;
        seed_user(&mut conn, 2, json!({"user_id": 2})).await;
        run(&mut conn, &config, &metadata, create_track(10, 2, json!({}))).await.unwrap();

        let follow = run(&mut conn, &config, &metadata, tx("User", "Follow", 2, 1)).await.unwrap();
        assert_eq!(follow.events.len(), 1);
        assert_eq!(follow.events[0].event, ChallengeEvent::Follow);
        assert_eq!(follow.events[0].user_id, 1);
        assert_eq!(follow.events[0].extra["followee_user_id"], 2);

        let save = run(&mut conn, &config, &metadata, tx("Track", "Save", 10, 1)).await.unwrap();
        assert_eq!(save.events[0].event, ChallengeEvent::Favorite);
        let repost = run(&mut conn, &config, &metadata, tx("Track", "Repost", 10, 1)).await.unwrap();
        assert_eq!(repost.events[0].event, ChallengeEvent::Repost);
        assert_eq!(repost.events[0].extra["target_id"], 10);

        let unfollow = run(&mut conn, &config, &metadata, tx("User", "Unfollow", 2, 1)).await.unwrap();
        assert_eq!(unfollow.events[0].event, ChallengeEvent::Follow);
        assert_eq!(unfollow.events[0].extra["is_delete"], true);
    }

    #[tokio::test]
    async fn parent_artist_saving_a_remix_cosigns_it() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let config = IndexerConfig::default();
        let metadata = MemoryMetadataStore::new();
        for id in [1, 2, 3] {
            seed_user(&mut conn, id, json!({"user_id": id})).await;
        }
        run(&mut conn, &config, &metadata, create_track(10, 1, json!({}))).await.unwrap();
        let remix_of = json!({"remix_of": {"tracks": [{"parent_track_id": 10}]}});
        run(&mut conn, &config, &metadata, create_track(11, 2, remix_of)).await.unwrap();

        // A stranger's save is not a cosign.
        let stranger = run(&mut conn, &config, &metadata, tx("Track", "Save", 11, 3)).await.unwrap();
        assert!(stranger.events.iter().all(|e| e.event != ChallengeEvent::Cosign));

        let artist = run(&mut conn, &config, &metadata, tx("Track", "Repost", 11, 1)).await.unwrap();
        let cosign = artist.events.iter().find(|e| e.event == ChallengeEvent::Cosign).unwrap();
        assert_eq!(cosign.user_id, 2);
        assert_eq!(cosign.extra["track_id"], 11);
        assert_eq!(cosign.extra["parent_track_id"], 10);
        assert_eq!(cosign.extra["cosigner_user_id"], 1);
    }
}
