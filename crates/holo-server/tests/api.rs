use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use holo_server::config::parse_config;
use holo_server::{app, build_orchestrator, AppState};
use holo_session::MemoryTurnStore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tower::ServiceExt;

const CONFIG: &str = r#"
[pipeline.latency]
generation_soft_deadline_ms = 800
generation_total_deadline_ms = 4000
synthesis_soft_deadline_ms = 700
hard_deadline_ms = 2000
target_mean_ms = 1200
target_p95_ms = 2000

[pipeline.context]
max_turns = 8
max_chars = 4000
eviction = "drop_oldest"

[pipeline.turn]
likely_final_confidence = 0.6
likely_final_min_ms = 300
arbitration_window_ms = 100
pending_capacity = 4
barge_in_energy = 0.2
barge_in_min_ms = 200

[pipeline.ingress]
sample_rate = 16000
reorder_window_ms = 0
speech_energy = 0.05
end_of_speech_ms = 300
max_utterance_ms = 15000

[pipeline.link]
grace_period_ms = 20000
unacked_capacity = 256

[pipeline.adapters]
retry_backoff_ms = 50
chunk_timeout_ms = 1500
recognition_final_timeout_ms = 2000
cleanup_timeout_ms = 100

[pipeline.session]
idle_timeout_ms = 600000
cancel_ack_timeout_ms = 250
stage_queue_capacity = 16
latency_samples = 64
history_len = 64

[pipeline.quotas.free]
max_concurrent_sessions = 1
max_turns_per_session = 50
max_response_chars = 400

[pipeline.quotas.premium]
max_concurrent_sessions = 10
max_turns_per_session = 1000
max_response_chars = 2000

[engines]
kind = "scripted"
transcript = "hello there"
reply = ["Hi there!"]

[entitlements.tiers]
ada = "premium"
"#;

struct TestServer {
    state: Arc<AppState>,
    store: MemoryTurnStore,
}

fn test_server() -> TestServer {
    let config = parse_config(CONFIG).unwrap();
    let store = MemoryTurnStore::new();
    let orchestrator = build_orchestrator(&config, Arc::new(store.clone())).unwrap();
    let state = Arc::new(AppState {
        orchestrator,
        max_audio_frame_bytes: config.server.max_audio_frame_bytes,
    });
    TestServer { state, store }
}

async fn call(state: &Arc<AppState>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn create_session(state: &Arc<AppState>, participants: &[&str]) -> String {
    let (status, body) = call(
        state,
        "POST",
        "/api/sessions",
        Some(json!({ "companion_id": "nova", "participants": participants })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["session_id"].as_str().unwrap().to_string()
}

async fn listen(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

/// A device that acknowledges every frame and records it.
struct Device {
    frames: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl Device {
    async fn connect(addr: SocketAddr, link_id: &str, token: &str) -> Self {
        let url = format!("ws://{addr}/ws/links/{link_id}?token={token}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let seen = frames.clone();
        let task = tokio::spawn(async move {
            while let Some(Ok(msg)) = rx.next().await {
                let Message::Text(text) = msg else { continue };
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                let seq = frame["seq"].as_u64().unwrap();
                seen.lock().unwrap().push(frame);
                let ack = json!({ "type": "ack", "seq": seq }).to_string();
                if tx.send(Message::Text(ack.into())).await.is_err() {
                    break;
                }
            }
        });
        Self { frames, task }
    }

    fn types(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn turn_ended(&self) -> bool {
        self.types().iter().any(|t| t == "turn_end")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 10s");
}

async fn attach(state: &Arc<AppState>, session_id: &str) -> (String, String) {
    let (status, body) = call(
        state,
        "POST",
        &format!("/api/sessions/{session_id}/devices"),
        Some(json!({ "device_id": "desk-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    (
        body["link_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

fn http_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other}"),
    }
}

#[tokio::test]
async fn health_check_returns_ok() {
    let server = test_server();
    let (status, body) = call(&server.state, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let server = test_server();
    let state = &server.state;
    let id = create_session(state, &["ada", "ben"]).await;

    let (status, body) = call(state, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], "ada");
    assert_eq!(body["tier"], "premium");
    assert_eq!(body["participants"], json!(["ada", "ben"]));

    let (status, body) = call(state, "GET", "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = call(state, "POST", &format!("/api/sessions/{id}/heartbeat"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(state, "DELETE", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");

    // Closed sessions stay visible but reject input.
    let (status, body) = call(state, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");
    let (status, _) = call(state, "POST", &format!("/api/sessions/{id}/heartbeat"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = call(state, "DELETE", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let server = test_server();
    let state = &server.state;

    let unknown = uuid_like();
    let (status, body) = call(state, "GET", &format!("/api/sessions/{unknown}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = call(
        state,
        "POST",
        "/api/sessions",
        Some(json!({ "companion_id": "nova", "participants": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Free tier allows one concurrent session per owner.
    create_session(state, &["cal"]).await;
    let (status, body) = call(
        state,
        "POST",
        "/api/sessions",
        Some(json!({ "companion_id": "nova", "participants": ["cal"] })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("free"));

    let id = create_session(state, &["ada"]).await;
    let (status, _) = call(
        state,
        "POST",
        &format!("/api/sessions/{id}/text"),
        Some(json!({ "participant_id": "mallory", "text": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        state,
        "POST",
        &format!("/api/sessions/{id}/devices"),
        Some(json!({ "device_id": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn uuid_like() -> String {
    "7f0c8a52-2d6e-4f8e-9b1a-3c5d7e9f1a2b".to_string()
}

#[tokio::test]
async fn text_turn_reaches_device_and_history() {
    let server = test_server();
    let state = server.state.clone();
    let addr = listen(state.clone()).await;
    let id = create_session(&state, &["ada"]).await;
    let (link_id, token) = attach(&state, &id).await;
    let device = Device::connect(addr, &link_id, &token).await;

    let (status, _) = call(
        &state,
        "POST",
        &format!("/api/sessions/{id}/text"),
        Some(json!({ "participant_id": "ada", "text": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    eventually(|| device.turn_ended()).await;
    let types = device.types();
    assert_eq!(types.first().map(String::as_str), Some("turn_start"));
    assert!(types.iter().any(|t| t == "audio"));
    assert!(types.iter().any(|t| t == "cue"));

    let session_id = id.parse().unwrap();
    let store = server.store.clone();
    for _ in 0..500 {
        if !holo_session::TurnStore::list_turns(&store, session_id)
            .await
            .unwrap()
            .is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (status, turns) = call(&state, "GET", &format!("/api/sessions/{id}/turns"), None).await;
    assert_eq!(status, StatusCode::OK);
    let turns = turns.as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["input"], "hello");
    assert_eq!(turns[0]["response_text"], "Hi there!");
    assert_eq!(turns[0]["completion"]["status"], "completed");

    let (status, export) = call(&state, "GET", &format!("/api/sessions/{id}/export"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["turns"].as_array().unwrap().len(), 1);

    let (status, body) = call(&state, "DELETE", &format!("/api/sessions/{id}/turns"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
}

#[tokio::test]
async fn audio_socket_drives_a_turn() {
    let server = test_server();
    let state = server.state.clone();
    let addr = listen(state.clone()).await;
    let id = create_session(&state, &["ada"]).await;
    let (link_id, token) = attach(&state, &id).await;
    let device = Device::connect(addr, &link_id, &token).await;

    let url = format!("ws://{addr}/ws/sessions/{id}/audio?participant=ada");
    let (mut audio, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let samples = 4_000i16.to_le_bytes().repeat(320);
    for i in 0..30u64 {
        let mut data = (i * 20).to_le_bytes().to_vec();
        data.extend_from_slice(&samples);
        audio.send(Message::Binary(data.into())).await.unwrap();
    }
    audio.close(None).await.unwrap();

    eventually(|| device.turn_ended()).await;

    let session_id = id.parse().unwrap();
    let store = server.store.clone();
    let mut turns = Vec::new();
    for _ in 0..500 {
        turns = holo_session::TurnStore::list_turns(&store, session_id)
            .await
            .unwrap();
        if !turns.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].speaker, "ada");
    assert_eq!(turns[0].input, "hello there");
    assert_eq!(turns[0].response_text, "Hi there!");
}

#[tokio::test]
async fn websocket_handshakes_are_validated() {
    let server = test_server();
    let state = server.state.clone();
    let addr = listen(state.clone()).await;
    let id = create_session(&state, &["ada"]).await;

    let outsider = format!("ws://{addr}/ws/sessions/{id}/audio?participant=mallory");
    let err = tokio_tungstenite::connect_async(outsider).await.unwrap_err();
    assert_eq!(http_status(err), 400);

    let unknown = format!("ws://{addr}/ws/sessions/{}/audio?participant=ada", uuid_like());
    let err = tokio_tungstenite::connect_async(unknown).await.unwrap_err();
    assert_eq!(http_status(err), 404);

    let (link_id, token) = attach(&state, &id).await;
    let first = if token.starts_with('0') { '1' } else { '0' };
    let forged = format!("ws://{addr}/ws/links/{link_id}?token={first}{}", &token[1..]);
    let err = tokio_tungstenite::connect_async(forged).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    // Nothing was sent yet, so there is nothing to resume after seq 5.
    let ahead = format!("ws://{addr}/ws/links/{link_id}?token={token}&last_ack=5");
    let err = tokio_tungstenite::connect_async(ahead).await.unwrap_err();
    assert_eq!(http_status(err), 422);

    let ok = format!("ws://{addr}/ws/links/{link_id}?token={token}&last_ack=0");
    assert!(tokio_tungstenite::connect_async(ok).await.is_ok());
}
