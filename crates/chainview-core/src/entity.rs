//! Entity-manager transaction model and versioned entity rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, TxError};

// ─── EntityType / Action ──────────────────────────────────────────────────────

/// Kind of versioned entity. All kinds share the `entity_versions` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    User,
    Track,
    Playlist,
    Follow,
    Save,
    Repost,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        Self::User,
        Self::Track,
        Self::Playlist,
        Self::Follow,
        Self::Save,
        Self::Repost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Track => "Track",
            Self::Playlist => "Playlist",
            Self::Follow => "Follow",
            Self::Save => "Save",
            Self::Repost => "Repost",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| IndexerError::Other(format!("unknown entity type '{s}'")))
    }
}

/// Action requested by an entity-manager transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    Verify,
    Tip,
    Listen,
    Follow,
    Unfollow,
    Save,
    Unsave,
    Repost,
    Unrepost,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── ManageEntity ─────────────────────────────────────────────────────────────

/// Decoded entity-manager payload.
///
/// ```json
/// {"entity_type": "Track", "entity_id": 12, "action": "Create", "user_id": 7,
///  "metadata": {"title": "..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManageEntity {
    pub entity_type: EntityType,
    pub entity_id: u64,
    pub action: Action,
    /// Signer of the transaction.
    pub user_id: u64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ManageEntity {
    /// Decode a transaction payload. Anything malformed is a network-level skip.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, TxError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| TxError::invalid(format!("malformed entity payload: {e}")))
    }

    /// Metadata object, or an empty object when absent.
    pub fn metadata_object(&self) -> serde_json::Map<String, serde_json::Value> {
        match &self.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }

    /// `metadata.cid`, when the metadata lives off-chain.
    pub fn metadata_cid(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("cid"))
            .and_then(|v| v.as_str())
    }
}

// ─── Writes and versions ──────────────────────────────────────────────────────

/// A new version to append for one entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub entity_type: EntityType,
    pub entity_key: String,
    pub is_delete: bool,
    pub fields: serde_json::Value,
}

impl EntityWrite {
    pub fn upsert(entity_type: EntityType, entity_key: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            entity_type,
            entity_key: entity_key.into(),
            is_delete: false,
            fields,
        }
    }

    pub fn delete(entity_type: EntityType, entity_key: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            entity_type,
            entity_key: entity_key.into(),
            is_delete: true,
            fields,
        }
    }
}

/// A persisted version row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_key: String,
    pub blockhash: String,
    pub blocknumber: u64,
    pub slot: Option<u64>,
    pub txhash: String,
    pub is_current: bool,
    pub is_delete: bool,
    pub fields: serde_json::Value,
}

impl EntityVersion {
    /// Current and not deleted.
    pub fn is_live(&self) -> bool {
        self.is_current && !self.is_delete
    }

    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(|v| v.as_u64())
    }

    pub fn field_bool(&self, name: &str) -> bool {
        self.fields
            .get(name)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ─── Natural keys ─────────────────────────────────────────────────────────────

pub fn follow_key(follower: u64, followee: u64) -> String {
    format!("{follower}:{followee}")
}

/// Key of a save or repost: `{user}:{Track|Playlist}:{id}`.
pub fn social_key(user_id: u64, target: EntityType, target_id: u64) -> String {
    format!("{user_id}:{target}:{target_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_payload() {
        let me = ManageEntity::parse(&json!({
            "entity_type": "Track",
            "entity_id": 12,
            "action": "Create",
            "user_id": 7,
            "metadata": {"cid": "Qm123"}
        }))
        .unwrap();
        assert_eq!(me.entity_type, EntityType::Track);
        assert_eq!(me.action, Action::Create);
        assert_eq!(me.metadata_cid(), Some("Qm123"));
    }

    #[test]
    fn unknown_action_is_invalid() {
        let err = ManageEntity::parse(&json!({
            "entity_type": "Track",
            "entity_id": 12,
            "action": "Explode",
            "user_id": 7
        }))
        .unwrap_err();
        assert!(matches!(err, TxError::Invalid(_)));
    }

    #[test]
    fn entity_type_roundtrips_through_str() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("Album".parse::<EntityType>().is_err());
    }

    #[test]
    fn keys() {
        assert_eq!(follow_key(1, 2), "1:2");
        assert_eq!(social_key(1, EntityType::Playlist, 9), "1:Playlist:9");
    }
}
