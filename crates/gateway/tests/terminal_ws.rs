//! End-to-end tests of the terminal WebSocket against the in-memory engine.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway::{
    AppState, AuthTokens, SessionLimits, SessionManager, TerminalGateway, router,
    wire_session_close,
};
use proto::SessionId;
use sandbox::testkit::FakeDriver;
use sandbox::{ContainerManager, SandboxConfig};
use store::{ChallengeCatalog, ProgressStore};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestApp {
    port: u16,
    base: String,
    registry: Arc<SessionManager>,
    terminals: Arc<TerminalGateway>,
    tokens: Arc<AuthTokens>,
    sandbox: Arc<ContainerManager>,
    _tmp: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn spawn_app() -> TestApp {
    let tmp = tempfile::tempdir().expect("tempdir");
    let challenges = tmp.path().join("challenges");
    let dir = challenges.join("file-hunt");
    std::fs::create_dir_all(&dir).expect("challenge dir");
    std::fs::write(dir.join("challenge.yaml"), "id: 1\ntitle: \"File hunt\"\n")
        .expect("manifest");
    std::fs::write(dir.join("validate.sh"), "#!/bin/bash\nexit 0\n").expect("validate");

    let driver = Arc::new(FakeDriver::new());
    let catalog = Arc::new(ChallengeCatalog::load(&challenges).await.expect("catalog"));
    let progress = Arc::new(
        ProgressStore::open(tmp.path().join("progress.db").to_str().expect("utf8"))
            .await
            .expect("store"),
    );
    let registry = Arc::new(SessionManager::new(SessionLimits::default()));
    let sandbox = Arc::new(ContainerManager::new(
        driver,
        catalog.clone(),
        SandboxConfig::default(),
    ));
    let terminals = Arc::new(TerminalGateway::new());
    wire_session_close(&registry, terminals.clone());
    let tokens = Arc::new(AuthTokens::new("test-secret"));

    let state = AppState {
        registry: registry.clone(),
        sandbox: sandbox.clone(),
        progress,
        catalog,
        terminals: terminals.clone(),
        tokens: tokens.clone(),
        accepting: Arc::new(AtomicBool::new(true)),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    let app = router(state);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestApp {
        port,
        base: format!("http://127.0.0.1:{port}"),
        registry,
        terminals,
        tokens,
        sandbox,
        _tmp: tmp,
        server,
    }
}

/// Provision a container and register a session for it, like the start
/// handler does.
async fn open_session(app: &TestApp, user_id: i64) -> SessionId {
    let container_id = app
        .sandbox
        .create_for_challenge(1, user_id)
        .await
        .expect("create container");
    app.registry.create(user_id, 1, container_id).id
}

async fn connect_terminal(app: &TestApp, token: &str, session_id: &str) -> WsClient {
    let url = format!(
        "ws://127.0.0.1:{}/terminal?token={token}&sessionId={session_id}",
        app.port
    );
    let (ws, _) = connect_async(url).await.expect("connect websocket");
    ws
}

fn user_token(app: &TestApp, user_id: i64) -> String {
    app.tokens.issue(user_id, Duration::from_secs(3600))
}

async fn expect_close_code(ws: &mut WsClient, expected: u16) {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for close frame")
            .expect("socket ended without close frame")
            .expect("websocket error");
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), expected);
                return;
            }
            Message::Close(None) => panic!("close frame carried no code"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn relays_bytes_both_ways() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    ws.send(Message::Binary(b"echo ok\n".as_ref().into()))
        .await
        .expect("send");

    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timeout waiting for echo")
        .expect("socket closed")
        .expect("websocket error");
    match msg {
        Message::Binary(data) => assert_eq!(&data[..], b"echo ok\n"),
        other => panic!("expected binary frame, got {other:?}"),
    }

    assert_eq!(app.terminals.connection_count(), 1);
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn text_frames_reach_the_pty_too() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    ws.send(Message::Text("ls -la\n".into()))
        .await
        .expect("send");

    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timeout")
        .expect("socket closed")
        .expect("websocket error");
    match msg {
        Message::Binary(data) => assert_eq!(&data[..], b"ls -la\n"),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_token_closes_with_policy_violation() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;

    let mut ws = connect_terminal(&app, "not-a-token", &session_id.to_string()).await;
    expect_close_code(&mut ws, 1008).await;
}

#[tokio::test]
async fn unknown_session_closes_with_policy_violation() {
    let app = spawn_app().await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &SessionId::new().to_string()).await;
    expect_close_code(&mut ws, 1008).await;
}

#[tokio::test]
async fn foreign_session_closes_with_policy_violation() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let intruder_token = user_token(&app, 43);

    let mut ws = connect_terminal(&app, &intruder_token, &session_id.to_string()).await;
    expect_close_code(&mut ws, 1008).await;
}

#[tokio::test]
async fn attach_failure_closes_with_internal_error() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    // Session points at a container the engine no longer knows.
    let container_id = app.registry.get(session_id).expect("session").container_id;
    app.sandbox.remove(&container_id).await.expect("remove");
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    expect_close_code(&mut ws, 1011).await;
}

#[tokio::test]
async fn ending_the_session_closes_the_socket() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    // Make sure the relay is attached before ending the session.
    ws.send(Message::Binary(b"pwd\n".as_ref().into()))
        .await
        .expect("send");
    let _ = timeout(Duration::from_secs(2), ws.next()).await.expect("echo");

    app.registry.end(session_id);
    expect_close_code(&mut ws, 1000).await;
}

#[tokio::test]
async fn simultaneous_close_paths_tear_down_exactly_once() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    ws.send(Message::Binary(b"pwd\n".as_ref().into()))
        .await
        .expect("send");
    let _ = timeout(Duration::from_secs(2), ws.next()).await.expect("echo");

    // Fire the close and error paths together: a client-side close racing
    // two explicit server-side closes.
    let terminals_a = app.terminals.clone();
    let terminals_b = app.terminals.clone();
    let (a, b, _) = tokio::join!(
        tokio::spawn(async move { terminals_a.close_session(session_id) }),
        tokio::spawn(async move { terminals_b.close_session(session_id) }),
        ws.close(None),
    );
    a.expect("join");
    b.expect("join");

    // Give the relay tasks a beat to unwind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.terminals.teardown_count(), 1);
    assert_eq!(app.terminals.connection_count(), 0);
}

#[tokio::test]
async fn validate_success_over_http_closes_the_terminal() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    ws.send(Message::Binary(b"pwd\n".as_ref().into()))
        .await
        .expect("send");
    let _ = timeout(Duration::from_secs(2), ws.next()).await.expect("echo");

    let resp = reqwest::Client::new()
        .post(format!("{}/sessions/{session_id}/validate", app.base))
        .header("authorization", format!("Bearer {token}"))
        .send()
        .await
        .expect("POST validate");
    assert_eq!(resp.status(), 200);

    expect_close_code(&mut ws, 1000).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.terminals.connection_count(), 0);
}

#[tokio::test]
async fn relayed_bytes_count_as_activity() {
    let app = spawn_app().await;
    let session_id = open_session(&app, 42).await;
    let token = user_token(&app, 42);

    let before = app.registry.get(session_id).expect("session").last_activity;

    let mut ws = connect_terminal(&app, &token, &session_id.to_string()).await;
    ws.send(Message::Binary(b"w\n".as_ref().into()))
        .await
        .expect("send");
    let _ = timeout(Duration::from_secs(2), ws.next()).await.expect("echo");

    let after = app.registry.get(session_id).expect("session").last_activity;
    assert!(after > before);
}
