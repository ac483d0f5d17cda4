//! Shared protocol types for the session platform.
//!
//! This crate defines the session model, serializable API wire types, and
//! strongly-typed error enums shared across the workspace.

pub mod api;
pub mod error;
pub mod session;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of API request/response types.
pub use api::{
    SessionDescriptor, SessionListResponse, StartSessionRequest, StartSessionResponse,
    ValidateResponse,
};
/// Re-export of session identity and lifecycle types.
pub use session::{ChallengeId, Session, SessionId, SessionStatus, UserId};
