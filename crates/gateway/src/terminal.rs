//! Authenticated WebSocket ↔ container PTY relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use proto::{SessionId, SessionStatus};
use sandbox::{ExecStream, PtySession};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::AppState;
use crate::registry::SessionManager;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    token: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

struct TerminalHandle {
    writer: mpsc::UnboundedSender<Message>,
    cleaned_up: Arc<AtomicBool>,
    pty_abort: tokio::task::AbortHandle,
}

/// Registry of live terminal connections, keyed by session id.
///
/// Teardown is guarded by a per-connection single-shot latch: whichever code
/// path flips it first — relay exit, an explicit close, shutdown — owns the
/// teardown, and every other path returns without touching the connection.
#[derive(Default)]
pub struct TerminalGateway {
    connections: DashMap<SessionId, TerminalHandle>,
    teardowns: AtomicUsize,
}

impl TerminalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently attached terminals.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of completed teardowns since start (diagnostics).
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Idempotent close for one session's terminal, if attached.
    pub fn close_session(&self, session_id: SessionId) {
        self.teardown(session_id);
    }

    /// Request every attached terminal to close.
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.teardown(id);
        }
    }

    fn teardown(&self, session_id: SessionId) {
        let Some(entry) = self.connections.get(&session_id) else {
            return;
        };
        if entry.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let writer = entry.writer.clone();
        let pty_abort = entry.pty_abort.clone();
        drop(entry);

        self.connections.remove(&session_id);
        let _ = writer.send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: Utf8Bytes::from_static("Session ended"),
        })));
        pty_abort.abort();
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        info!("Terminal for session {session_id} closed");
    }

    /// Relay bytes between the socket and the PTY until either side closes.
    async fn run(
        &self,
        socket: WebSocket,
        session_id: SessionId,
        pty: PtySession,
        registry: Arc<SessionManager>,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();

        // Writer relay: the only task that touches the sink. Ends after a
        // close frame or a failed send, dropping writes for a gone socket.
        let write_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let ExecStream {
            mut output,
            mut input,
        } = pty.stream;

        // PTY -> socket
        let pty_tx = msg_tx.clone();
        let pty_task = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bytes) => {
                        if pty_tx.send(Message::Binary(bytes)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("PTY read error for session {session_id}: {e}");
                        break;
                    }
                }
            }
        });

        self.connections.insert(
            session_id,
            TerminalHandle {
                writer: msg_tx,
                cleaned_up: Arc::new(AtomicBool::new(false)),
                pty_abort: pty_task.abort_handle(),
            },
        );
        info!("Terminal attached for session {session_id}");

        // Socket -> PTY. Bytes go through verbatim and every relayed message
        // counts as session activity.
        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    if input.write_all(&data).await.is_err() {
                        break;
                    }
                    registry.update_activity(session_id);
                }
                Ok(Message::Text(text)) => {
                    if input.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    registry.update_activity(session_id);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Socket read error for session {session_id}: {e}");
                    break;
                }
            }
        }

        let _ = input.shutdown().await;
        self.teardown(session_id);
        let _ = pty_task.await;
        let _ = write_task.await;
    }
}

/// GET /terminal — upgrade, authenticate, attach, relay.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(socket, query, state))
}

async fn handle_terminal(socket: WebSocket, query: TerminalQuery, state: AppState) {
    let Some(token) = query.token.as_deref() else {
        return reject(socket, CLOSE_POLICY, "Missing token").await;
    };
    let user_id = match state.tokens.verify(token) {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!("Terminal auth failed: {e}");
            return reject(socket, CLOSE_POLICY, "Authentication failed").await;
        }
    };

    let session = query
        .session_id
        .as_deref()
        .and_then(SessionId::parse)
        .and_then(|id| state.registry.get(id));
    let Some(session) = session else {
        return reject(socket, CLOSE_POLICY, "Unknown session").await;
    };
    if session.user_id != user_id {
        return reject(socket, CLOSE_POLICY, "Session belongs to another user").await;
    }
    if session.status != SessionStatus::Active {
        return reject(socket, CLOSE_POLICY, "Session is not active").await;
    }

    let pty = match state.sandbox.attach_pty(&session.container_id).await {
        Ok(pty) => pty,
        Err(e) => {
            error!("PTY attach failed for session {}: {e}", session.id);
            return reject(socket, CLOSE_INTERNAL, "Terminal attach failed").await;
        }
    };

    state
        .terminals
        .run(socket, session.id, pty, state.registry.clone())
        .await;
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle(tx: mpsc::UnboundedSender<Message>) -> TerminalHandle {
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        TerminalHandle {
            writer: tx,
            cleaned_up: Arc::new(AtomicBool::new(false)),
            pty_abort: task.abort_handle(),
        }
    }

    #[tokio::test]
    async fn teardown_runs_at_most_once_per_session() {
        let gateway = TerminalGateway::new();
        let session_id = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.connections.insert(session_id, dummy_handle(tx));

        gateway.close_session(session_id);
        gateway.close_session(session_id);
        gateway.close_all();

        assert_eq!(gateway.teardown_count(), 1);
        assert_eq!(gateway.connection_count(), 0);

        // Exactly one close frame went out.
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(frame))) if frame.code == CLOSE_NORMAL));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_for_unknown_session_is_a_noop() {
        let gateway = TerminalGateway::new();
        gateway.close_session(SessionId::new());
        assert_eq!(gateway.teardown_count(), 0);
    }

    #[tokio::test]
    async fn close_all_covers_every_connection() {
        let gateway = TerminalGateway::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            gateway.connections.insert(SessionId::new(), dummy_handle(tx));
            receivers.push(rx);
        }

        gateway.close_all();

        assert_eq!(gateway.teardown_count(), 3);
        assert_eq!(gateway.connection_count(), 0);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
        }
    }
}
