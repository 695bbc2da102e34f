//! Built-in entity handlers.
//!
//! | entity_type / action | handler |
//! |---|---|
//! | User Create, Update, Verify, Tip | [`UserHandler`] |
//! | Track / Playlist Create, Update, Delete; Track Listen | [`ContentHandler`] |
//! | User Follow, Unfollow; Track / Playlist Save, Unsave, Repost, Unrepost | [`SocialHandler`] |

mod content;
mod social;
mod user;

pub use content::ContentHandler;
pub use social::SocialHandler;
pub use user::UserHandler;

#[cfg(test)]
pub(crate) mod testing {
    use chainview_core::config::IndexerConfig;
    use chainview_core::entity::{EntityType, EntityWrite};
    use chainview_core::error::TxError;
    use chainview_core::types::BlockRef;
    use chainview_storage::versions;
    use sqlx::SqliteConnection;

    use crate::handler::{HandlerRegistry, TxContext, TxEffects};
    use crate::metadata::MemoryMetadataStore;

    /// Run one payload through the default handlers and apply its writes.
    pub async fn run(
        conn: &mut SqliteConnection,
        config: &IndexerConfig,
        metadata: &MemoryMetadataStore,
        payload: serde_json::Value,
    ) -> Result<TxEffects, TxError> {
        let effects = {
            let mut ctx = TxContext {
                conn: &mut *conn,
                config,
                metadata,
                block_number: 1,
                blockhash: "0x1",
                tx_hash: "0xa",
            };
            HandlerRegistry::with_defaults().dispatch(&mut ctx, &payload).await?
        };
        let block = BlockRef {
            blockhash: "0x1".into(),
            blocknumber: 1,
            slot: None,
        };
        for write in &effects.writes {
            versions::apply_transaction(conn, write, &block, "0xa").await?;
        }
        Ok(effects)
    }

    pub async fn seed_user(conn: &mut SqliteConnection, id: u64, fields: serde_json::Value) {
        let block = BlockRef {
            blockhash: "0x0".into(),
            blocknumber: 0,
            slot: None,
        };
        versions::apply_transaction(conn, &EntityWrite::upsert(EntityType::User, id.to_string(), fields), &block, "0x0")
            .await
            .unwrap();
    }
}
