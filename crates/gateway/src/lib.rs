//! Session admission, terminal streaming, and the session HTTP surface.

pub mod auth;
pub mod http;
pub mod reaper;
pub mod registry;
pub mod terminal;

/// HMAC token verification for the HTTP and WebSocket surfaces.
pub use auth::AuthTokens;
/// Axum application state and router assembly.
pub use http::{AppState, router};
/// Periodic reclamation of expired sessions.
pub use reaper::CleanupLoop;
/// In-memory session registry with admission control.
pub use registry::{Reservation, SessionLimits, SessionManager};
/// WebSocket ↔ container PTY relay.
pub use terminal::TerminalGateway;

use std::sync::Arc;

/// Connects the registry's end-of-session notifications to the terminal
/// gateway so that ending a session closes its socket without the registry
/// ever calling into the gateway directly.
pub fn wire_session_close(registry: &SessionManager, terminals: Arc<TerminalGateway>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    registry.set_close_notifier(tx);
    tokio::spawn(async move {
        while let Some(session_id) = rx.recv().await {
            terminals.close_session(session_id);
        }
    });
}
