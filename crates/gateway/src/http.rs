//! Session HTTP surface and the validation use case.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use proto::{
    SandboxError, SessionDescriptor, SessionError, SessionId, SessionListResponse,
    StartSessionResponse, UserId, ValidateResponse,
};
use sandbox::ContainerManager;
use serde_json::json;
use store::{ChallengeCatalog, ProgressStore};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::auth::AuthTokens;
use crate::registry::{Reservation, SessionManager};
use crate::terminal::{TerminalGateway, terminal_ws};

const SOLVED_MESSAGE: &str = "Congratulations! Challenge solved!";
const FAILED_MESSAGE: &str = "Validation failed. Keep trying!";

/// Everything the handlers need, shared by reference.
///
/// Built once at startup and cloned per request; all fields are `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionManager>,
    pub sandbox: Arc<ContainerManager>,
    pub progress: Arc<ProgressStore>,
    pub catalog: Arc<ChallengeCatalog>,
    pub terminals: Arc<TerminalGateway>,
    pub tokens: Arc<AuthTokens>,
    /// Cleared during shutdown so no new sessions are admitted.
    pub accepting: Arc<AtomicBool>,
}

/// Builds the session API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/start", post(start_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/validate", post(validate_session))
        .route("/terminal", get(terminal_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Error mapping ─────────────────────────────────────────

enum ApiError {
    Unauthorized,
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    CapacityExceeded(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".into()),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::CapacityExceeded(m) => (StatusCode::TOO_MANY_REQUESTS, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    state.tokens.verify(token).map_err(|_| ApiError::Unauthorized)
}

/// Looks up a session and checks ownership.
fn owned_session(
    state: &AppState,
    user_id: UserId,
    raw_id: &str,
) -> Result<proto::Session, ApiError> {
    let session_id = SessionId::parse(raw_id)
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))?;
    let session = state
        .registry
        .get(session_id)
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))?;
    if session.user_id != user_id {
        return Err(ApiError::Forbidden("Session belongs to another user".into()));
    }
    Ok(session)
}

// ─── Handlers ──────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /sessions/start — admission, container provisioning, registration.
async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;

    if !state.accepting.load(Ordering::SeqCst) {
        return Err(ApiError::Unavailable("Server is shutting down".into()));
    }

    let challenge_id = body
        .get("challengeId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ApiError::BadRequest("challengeId is required".into()))?;

    // One atomic decision: existing session, in-flight duplicate, cap
    // denial, or a granted slot. The slot keeps counting against the caps
    // while the container is created below, outside the registry lock.
    let reservation = match state.registry.try_reserve(user_id, challenge_id) {
        Ok(reservation) => reservation,
        Err(SessionError::DuplicatePending) => {
            return Err(ApiError::Conflict(
                "Session creation already in progress".into(),
            ));
        }
        Err(e) => return Err(ApiError::CapacityExceeded(e.to_string())),
    };

    if let Reservation::Existing(existing) = reservation {
        return Ok(Json(StartSessionResponse {
            session_id: existing.id,
            expires_at: existing.expires_at,
            message: Some("Existing session found".into()),
        }));
    }

    let container_id = match state
        .sandbox
        .create_for_challenge(challenge_id, user_id)
        .await
    {
        Ok(container_id) => container_id,
        Err(e) => {
            state.registry.release(user_id, challenge_id);
            return Err(match e {
                SandboxError::ChallengeNotFound(id) => {
                    ApiError::NotFound(format!("Unknown challenge {id}"))
                }
                other => {
                    error!("Container create failed for user {user_id}: {other}");
                    ApiError::Internal("Failed to create session".into())
                }
            });
        }
    };

    let session = state.registry.create(user_id, challenge_id, container_id);

    info!("Session {} started for user {user_id}", session.id);
    Ok(Json(StartSessionResponse {
        session_id: session.id,
        expires_at: session.expires_at,
        message: None,
    }))
}

/// POST /sessions/{id}/validate — the validation use case.
///
/// Runs the challenge's validate script in the session's container, couples
/// the verdict to the attempt/solve records in one store transaction, and on
/// success reclaims the container and ends the session.
async fn validate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let session = owned_session(&state, user_id, &raw_id)?;

    let already_solved = state
        .progress
        .has_solved(user_id, session.challenge_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let success = state
        .sandbox
        .validate(&session.container_id, session.challenge_id)
        .await;

    state
        .progress
        .record_validation(user_id, session.challenge_id, success)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !success {
        return Ok(Json(ValidateResponse {
            success: false,
            message: FAILED_MESSAGE.into(),
            points: None,
        }));
    }

    let points = state.catalog.points(session.challenge_id).unwrap_or(0);

    // The cleanup loop reclaims the container if this fails.
    if let Err(e) = state.sandbox.remove(&session.container_id).await {
        warn!(
            "Container remove after solve failed for session {}: {e}",
            session.id
        );
    }
    state.registry.end(session.id);

    Ok(Json(ValidateResponse {
        success: true,
        message: SOLVED_MESSAGE.into(),
        points: Some(if already_solved { 0 } else { points }),
    }))
}

/// GET /sessions/{id}
async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<SessionDescriptor>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let session = owned_session(&state, user_id, &raw_id)?;
    Ok(Json(SessionDescriptor::from(&session)))
}

/// DELETE /sessions/{id} — user-initiated teardown.
///
/// Unlike the validate and cleanup paths, a failed container removal here
/// surfaces as a 500 and leaves the session alive, so the request can simply
/// be retried.
async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let session = owned_session(&state, user_id, &raw_id)?;

    if let Err(e) = state.sandbox.remove(&session.container_id).await {
        error!("Container remove failed for session {}: {e}", session.id);
        return Err(ApiError::Internal("Failed to end session".into()));
    }
    state.registry.end(session.id);

    Ok(Json(json!({ "message": "Session ended" })))
}

/// GET /sessions — the caller's active sessions.
async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    let sessions = state
        .registry
        .list_user(user_id)
        .iter()
        .map(SessionDescriptor::from)
        .collect();
    Ok(Json(SessionListResponse { sessions }))
}
