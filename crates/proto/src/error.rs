use thiserror::Error;

use crate::session::ChallengeId;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Raw container engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Container lifecycle error.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Session registry / admission error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Progress store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Challenge catalog error.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Token verification error.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Errors reported by the container engine driver.
///
/// The driver classifies engine responses and performs no retries; policy
/// lives in the layers above.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The referenced image, container, or exec does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A container with the requested name already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The engine reported a failing build step.
    #[error("Image build failed: {0}")]
    Build(String),

    /// Any other engine/transport failure.
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Container lifecycle errors surfaced by the sandbox manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Base image build failed.
    #[error("Image build failed: {0}")]
    ImageBuild(String),

    /// The challenge catalog has no directory for this id.
    #[error("Challenge not found: {0}")]
    ChallengeNotFound(ChallengeId),

    /// Container create/start/setup failed.
    #[error("Container create failed: {0}")]
    Create(String),

    /// Container removal failed.
    #[error("Container remove failed: {0}")]
    Remove(String),

    /// PTY attach failed.
    #[error("Terminal attach failed: {0}")]
    Attach(String),
}

/// Session registry errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Per-user or global cap reached; the reason is user-visible.
    #[error("{0}")]
    AdmissionDenied(String),

    /// A creation for this (user, challenge) is already in flight.
    #[error("Session creation already in progress")]
    DuplicatePending,

    /// No session with this id.
    #[error("Session not found")]
    NotFound,

    /// The session belongs to another user.
    #[error("Session belongs to another user")]
    Forbidden,

    /// The session is not in the active state.
    #[error("Session is not active")]
    NotActive,
}

/// Progress store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Challenge catalog errors
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Filesystem error while scanning the challenges root.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest parse error.
    #[error("Invalid manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    /// Two directories declare the same challenge id.
    #[error("Duplicate challenge id {0}")]
    Duplicate(ChallengeId),

    /// Unknown challenge id.
    #[error("Unknown challenge {0}")]
    NotFound(ChallengeId),

    /// The challenge directory lacks an executable validate.sh.
    #[error("Missing validate.sh in {0}")]
    MissingValidate(String),
}

/// Token verification errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token does not have the expected shape.
    #[error("Malformed token")]
    Malformed,

    /// The MAC does not match.
    #[error("Bad token signature")]
    BadSignature,

    /// The token is past its expiry.
    #[error("Token expired")]
    Expired,
}
