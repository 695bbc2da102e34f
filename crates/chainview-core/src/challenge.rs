//! Challenge model: static definitions, per-specifier progress, payouts and
//! the domain events that drive them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

// ─── ChallengeType ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    /// Completes on the first qualifying event.
    Boolean,
    /// Counts steps toward `step_count`.
    Numeric,
    /// Many instances per user, each complete at creation; capped by `step_count`.
    Aggregate,
    /// Instances scoped by a trending period, complete at creation.
    Trending,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Numeric => "numeric",
            Self::Aggregate => "aggregate",
            Self::Trending => "trending",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(Self::Boolean),
            "numeric" => Ok(Self::Numeric),
            "aggregate" => Ok(Self::Aggregate),
            "trending" => Ok(Self::Trending),
            other => Err(IndexerError::Other(format!("unknown challenge type '{other}'"))),
        }
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// Static challenge definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub challenge_type: ChallengeType,
    /// Reward per instance.
    pub amount: u64,
    pub active: bool,
    pub step_count: Option<u32>,
    /// Events from blocks below this height are ignored.
    pub starting_block: Option<u64>,
}

impl Challenge {
    /// Returns `true` if an event from `block_number` may affect this challenge.
    pub fn accepts_block(&self, block_number: u64) -> bool {
        self.starting_block.map_or(true, |start| block_number >= start)
    }
}

/// One instance of a challenge, keyed by `(challenge_id, specifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChallenge {
    pub challenge_id: String,
    pub specifier: String,
    pub user_id: u64,
    pub is_complete: bool,
    pub current_step_count: Option<u32>,
    pub completed_blocknumber: Option<u64>,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

impl UserChallenge {
    pub fn new(challenge: &Challenge, specifier: impl Into<String>, user_id: u64, amount: u64) -> Self {
        Self {
            challenge_id: challenge.id.clone(),
            specifier: specifier.into(),
            user_id,
            is_complete: false,
            current_step_count: match challenge.challenge_type {
                ChallengeType::Numeric => Some(0),
                _ => None,
            },
            completed_blocknumber: None,
            amount,
            created_at: Utc::now(),
        }
    }

    /// Mark complete at `block_number`. Completion is never undone.
    pub fn complete(&mut self, block_number: u64) {
        if !self.is_complete {
            self.is_complete = true;
            self.completed_blocknumber = Some(block_number);
        }
    }
}

/// Durable record that a challenge instance has been paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeDisbursement {
    pub challenge_id: String,
    pub specifier: String,
    pub user_id: u64,
    pub amount: u64,
    pub signature: String,
    pub slot: u64,
    pub created_at: DateTime<Utc>,
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// Domain events emitted by entity handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeEvent {
    TrackUpload,
    ProfileUpdate,
    MobileInstall,
    ReferralSignup,
    ReferredSignup,
    ConnectVerified,
    SendTip,
    FirstPlaylist,
    TrackListen,
    TrendingTrack,
    Follow,
    Repost,
    Favorite,
    /// The parent track's artist saved or reposted a remix.
    Cosign,
}

impl ChallengeEvent {
    pub const ALL: [ChallengeEvent; 14] = [
        Self::TrackUpload,
        Self::ProfileUpdate,
        Self::MobileInstall,
        Self::ReferralSignup,
        Self::ReferredSignup,
        Self::ConnectVerified,
        Self::SendTip,
        Self::FirstPlaylist,
        Self::TrackListen,
        Self::TrendingTrack,
        Self::Follow,
        Self::Repost,
        Self::Favorite,
        Self::Cosign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackUpload => "track_upload",
            Self::ProfileUpdate => "profile_update",
            Self::MobileInstall => "mobile_install",
            Self::ReferralSignup => "referral_signup",
            Self::ReferredSignup => "referred_signup",
            Self::ConnectVerified => "connect_verified",
            Self::SendTip => "send_tip",
            Self::FirstPlaylist => "first_playlist",
            Self::TrackListen => "track_listen",
            Self::TrendingTrack => "trending_track",
            Self::Follow => "follow",
            Self::Repost => "repost",
            Self::Favorite => "favorite",
            Self::Cosign => "cosign",
        }
    }
}

impl fmt::Display for ChallengeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeEvent {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| IndexerError::Other(format!("unknown challenge event '{s}'")))
    }
}

/// A durable, dispatched event as read back by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeEventRecord {
    pub id: i64,
    pub event: ChallengeEvent,
    pub block_number: u64,
    pub blockhash: Option<String>,
    pub user_id: u64,
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One event as seen by an updater, after the specifier has been derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub block_number: u64,
    pub user_id: u64,
    pub extra: serde_json::Value,
    pub specifier: String,
}

impl EventMetadata {
    pub fn extra_u64(&self, field: &str) -> Option<u64> {
        self.extra.get(field).and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(kind: ChallengeType, starting_block: Option<u64>) -> Challenge {
        Challenge {
            id: "c".into(),
            challenge_type: kind,
            amount: 1,
            active: true,
            step_count: Some(3),
            starting_block,
        }
    }

    #[test]
    fn starting_block_gate() {
        let c = challenge(ChallengeType::Boolean, Some(100));
        assert!(!c.accepts_block(50));
        assert!(c.accepts_block(100));
        assert!(challenge(ChallengeType::Boolean, None).accepts_block(0));
    }

    #[test]
    fn numeric_instances_start_at_zero_steps() {
        let uc = UserChallenge::new(&challenge(ChallengeType::Numeric, None), "7", 7, 1);
        assert_eq!(uc.current_step_count, Some(0));
        let uc = UserChallenge::new(&challenge(ChallengeType::Boolean, None), "7", 7, 1);
        assert_eq!(uc.current_step_count, None);
    }

    #[test]
    fn completion_block_is_sticky() {
        let mut uc = UserChallenge::new(&challenge(ChallengeType::Boolean, None), "7", 7, 1);
        uc.complete(10);
        uc.complete(20);
        assert_eq!(uc.completed_blocknumber, Some(10));
    }

    #[test]
    fn event_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&ChallengeEvent::MobileInstall).unwrap(),
            "\"mobile_install\""
        );
        for e in ChallengeEvent::ALL {
            assert_eq!(e.as_str().parse::<ChallengeEvent>().unwrap(), e);
        }
    }
}
