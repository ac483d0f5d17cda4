//! Request and response bodies for the session HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{ChallengeId, Session, SessionId, SessionStatus, UserId};

/// Body of `POST /sessions/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub challenge_id: ChallengeId,
}

/// Successful response of `POST /sessions/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response of `POST /sessions/{id}/validate`.
///
/// A failed validation is still a `200`; `success` carries the verdict and
/// `points` is present only on a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
}

/// Serializable view of a session for `GET /sessions` and `GET /sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for SessionDescriptor {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            challenge_id: s.challenge_id,
            status: s.status,
            created_at: s.created_at,
            expires_at: s.expires_at,
        }
    }
}

/// Response of `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionDescriptor>,
}
