use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identifier, issued by the external account system.
pub type UserId = i64;

/// Challenge identifier, issued by the challenge catalog.
pub type ChallengeId = i64;

/// Unique identifier for a shell session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a session identifier from its canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a session. Terminal states (`Expired`, `Ended`) are
/// only ever observed in events and logs; the registry drops the record on
/// the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Ended => "ended",
        };
        write!(f, "{s}")
    }
}

/// A live session binding a user, a challenge, and a running container.
///
/// Wall-clock timestamps (`created_at`, `expires_at`) are for display and API
/// responses; timeout arithmetic uses the monotonic `created` /
/// `last_activity` instants so that clock adjustments cannot expire or revive
/// a session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    pub container_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created: Instant,
    pub last_activity: Instant,
}
