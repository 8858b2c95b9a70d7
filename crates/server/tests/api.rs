//! End-to-end tests over the HTTP and WebSocket surface.
//!
//! The REST tests drive the router directly with `tower::ServiceExt`; the
//! WebSocket tests start a real listener and connect with tokio-tungstenite.
//! Bridge tests swap the multiplexer attach command for `/bin/cat`, which
//! holds the PTY open and echoes input back, so no tmux server is needed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tower::ServiceExt;

use claude_relay_core::{IndexConfig, SessionIndex};
use claude_relay_server::bridge::{BridgeSettings, TerminalBridges};
use claude_relay_server::{build_state, create_app, AppState, Config};

const PSK: &str = "test-psk-for-integration";
const SID: &str = "11111111-1111-1111-1111-111111111111";

async fn test_state(dir: &TempDir, attach_command: &[&str]) -> Arc<AppState> {
    let root = dir.path().join("projects");
    let proj = root.join("-Users-x-app");
    std::fs::create_dir_all(&proj).unwrap();
    std::fs::write(
        proj.join(format!("{SID}.jsonl")),
        concat!(
            "{\"cwd\":\"/Users/x/app\",\"version\":\"2.1.37\"}\n",
            "{\"type\":\"user\",\"message\":{\"content\":\"hello\"}}\n",
        ),
    )
    .unwrap();

    let index = SessionIndex::new(IndexConfig::new(root, dir.path().join("session-cache.json")));
    index.rescan().await.unwrap();

    let mut config = Config::default();
    config.auth.psk = PSK.to_string();
    // A binary that cannot exist keeps attach tests from touching a real
    // tmux server or CLI on the host.
    config.claude.binary = "claude-relay-missing-cli".to_string();

    let settings = BridgeSettings {
        attach_command: attach_command.iter().map(|s| s.to_string()).collect(),
        ..BridgeSettings::default()
    };
    let bridges = TerminalBridges::new(settings);
    build_state(config, index, bridges, "2.1.37".to_string())
}

async fn get(state: Arc<AppState>, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let response = create_app(state)
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post(state: Arc<AppState>, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let response = create_app(state)
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn start_server(state: Arc<AppState>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_connect(addr: SocketAddr, id: &str, token: &str) -> WsClient {
    let url = format!(
        "ws://127.0.0.1:{}/terminal/{id}?cols=80&rows=24&token={token}",
        addr.port()
    );
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn expect_close_code(ws: &mut WsClient, code: u16) {
    let deadline = Duration::from_secs(5);
    loop {
        match tokio::time::timeout(deadline, ws.next()).await {
            Ok(Some(Ok(tungstenite::Message::Close(Some(frame))))) => {
                assert_eq!(
                    frame.code,
                    tungstenite::protocol::frame::coding::CloseCode::from(code)
                );
                return;
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected close frame with code {code}, got {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// REST surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_is_reachable_without_auth() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (status, body) = get(state, "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["cli_version"], "2.1.37");
    assert_eq!(body["active_sessions"], 0);
    assert!(body["tabs"].is_array());
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn sessions_require_bearer_psk() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;

    let (status, body) = get(state.clone(), "/api/sessions", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHORIZED");
    assert!(body["message"].is_string());
    assert!(body["action"].is_string());

    let (status, _) = get(state.clone(), "/api/sessions", Some("wrong-psk")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = get(state, "/api/sessions", Some(PSK)).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], SID);
    assert_eq!(sessions[0]["project_path"], "/Users/x/app");
    assert_eq!(sessions[0]["project_name"], "app");
    assert_eq!(sessions[0]["last_message_preview"], "hello");
    assert_eq!(sessions[0]["last_message_role"], "user");
    assert_eq!(sessions[0]["cli_version"], "2.1.37");
}

#[tokio::test]
async fn session_detail_enforces_uuid_shape() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;

    let (status, body) = get(state.clone(), "/api/sessions/not-a-uuid", Some(PSK)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_SESSION_ID");

    let (status, body) = get(
        state.clone(),
        "/api/sessions/99999999-9999-9999-9999-999999999999",
        Some(PSK),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let (status, body) = get(state, &format!("/api/sessions/{SID}"), Some(PSK)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], SID);
    assert_eq!(body["has_active_connection"], false);
}

#[tokio::test]
async fn projects_roll_up_sessions() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (status, body) = get(state, "/api/projects", Some(PSK)).await;

    assert_eq!(status, StatusCode::OK);
    let projects = body.as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["project_path"], "/Users/x/app");
    assert_eq!(projects[0]["project_name"], "app");
    assert_eq!(projects[0]["session_count"], 1);
    assert!(projects[0]["latest_timestamp"].is_string());
}

#[tokio::test]
async fn attach_unknown_session_is_404() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (status, body) = post(
        state,
        "/api/sessions/99999999-9999-9999-9999-999999999999/attach",
        Some(PSK),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn attach_is_rate_limited_per_session() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let uri = format!("/api/sessions/{SID}/attach");

    // The first attempt's outcome depends on the host's tmux; only the
    // rate-limit behavior of the immediate retry is asserted.
    let _ = post(state.clone(), &uri, Some(PSK)).await;
    let (status, body) = post(state, &uri, Some(PSK)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "RATE_LIMITED");
}

// ---------------------------------------------------------------------------
// WebSocket surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_rejects_bad_token_with_4401() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state).await;

    let mut ws = ws_connect(addr, SID, "wrong-token").await;
    expect_close_code(&mut ws, 4401).await;
    server.abort();
}

#[tokio::test]
async fn ws_unknown_session_closes_4500() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state).await;

    let mut ws = ws_connect(addr, "99999999-9999-9999-9999-999999999999", PSK).await;
    expect_close_code(&mut ws, 4500).await;
    server.abort();
}

#[tokio::test]
async fn ws_bridges_bytes_to_the_pty() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state.clone()).await;

    let mut ws = ws_connect(addr, SID, PSK).await;
    ws.send(tungstenite::Message::Binary(b"echo-marker\n".to_vec().into()))
        .await
        .unwrap();

    // cat (and the PTY's own echo) sends the input back as binary output.
    let mut collected = Vec::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let tungstenite::Message::Binary(data) = msg {
                collected.extend_from_slice(&data);
                if collected.windows(11).any(|w| w == b"echo-marker") {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "PTY output never echoed back");
    assert!(state.bridges.has_active(SID));

    ws.close(None).await.ok();
    server.abort();
}

#[tokio::test]
async fn ws_second_attach_is_refused_with_4409() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state.clone()).await;

    let mut first = ws_connect(addr, SID, PSK).await;
    first
        .send(tungstenite::Message::Binary(b"ping\n".to_vec().into()))
        .await
        .unwrap();
    // Wait for the first bridge to be fully registered.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.bridges.has_active(SID) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let mut second = ws_connect(addr, SID, PSK).await;
    expect_close_code(&mut second, 4409).await;

    // The first connection is unaffected by the refused second one.
    first
        .send(tungstenite::Message::Binary(b"still-here\n".to_vec().into()))
        .await
        .unwrap();
    assert!(state.bridges.has_active(SID));

    first.close(None).await.ok();
    server.abort();
}

#[tokio::test]
async fn ws_disconnect_frees_the_session() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state.clone()).await;

    let mut ws = ws_connect(addr, SID, PSK).await;
    ws.send(tungstenite::Message::Binary(b"hi\n".to_vec().into()))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.bridges.has_active(SID) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    ws.close(None).await.ok();
    drop(ws);

    // Cleanup removes the bridge; a fresh attach then succeeds.
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.bridges.has_active(SID) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bridge was not cleaned up after disconnect");

    let mut again = ws_connect(addr, SID, PSK).await;
    again
        .send(tungstenite::Message::Binary(b"back\n".to_vec().into()))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.bridges.has_active(SID) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    again.close(None).await.ok();
    server.abort();
}

#[tokio::test]
async fn ws_resize_control_frame_is_accepted() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir, &["/bin/cat"]).await;
    let (addr, server) = start_server(state.clone()).await;

    let mut ws = ws_connect(addr, SID, PSK).await;
    ws.send(tungstenite::Message::Text(
        r#"{"type":"resize","cols":132,"rows":50}"#.into(),
    ))
    .await
    .unwrap();
    // Zero dimensions and unknown control types are ignored, not fatal.
    ws.send(tungstenite::Message::Text(
        r#"{"type":"resize","cols":0,"rows":50}"#.into(),
    ))
    .await
    .unwrap();
    ws.send(tungstenite::Message::Text(r#"{"type":"mystery"}"#.into()))
        .await
        .unwrap();
    ws.send(tungstenite::Message::Text("not json".into()))
        .await
        .unwrap();

    // The bridge is still alive and pumping after all of that.
    ws.send(tungstenite::Message::Binary(b"alive\n".to_vec().into()))
        .await
        .unwrap();
    let got_output = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = ws.next().await {
            if let tungstenite::Message::Binary(data) = msg {
                if data.windows(5).any(|w| w == b"alive") {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert_eq!(got_output, Ok(true));

    ws.close(None).await.ok();
    server.abort();
}
