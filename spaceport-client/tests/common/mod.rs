//! In-process mock of an app server and the hub API, built on axum.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// How the queue socket behaves after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Stream progress, one partial output, then the final output.
    Complete,
    /// Reject immediately with `queue_full`.
    Full,
    /// Drop the socket without a closing handshake mid-job.
    Drop,
    /// Report a failed job.
    Fail,
}

pub struct MockState {
    pub config: Mutex<Value>,
    pub info: Mutex<Option<Value>>,
    pub config_ready: AtomicBool,
    pub config_hits: AtomicUsize,
    pub run_requests: Mutex<Vec<(String, Value)>>,
    pub run_auth: Mutex<Vec<Option<String>>>,
    pub uploads: Mutex<Vec<String>>,
    pub resets: Mutex<Vec<Value>>,
    pub queue_mode: Mutex<QueueMode>,
    pub queue_signs: Mutex<Vec<Option<String>>>,
    pub queue_payloads: Mutex<Vec<Value>>,
    pub space_stages: Mutex<VecDeque<String>>,
    pub status_polls: AtomicUsize,
    pub discussions_disabled: AtomicBool,
    pub addr: Mutex<Option<SocketAddr>>,
}

impl MockState {
    fn new(config: Value) -> Self {
        Self {
            config: Mutex::new(config),
            info: Mutex::new(None),
            config_ready: AtomicBool::new(true),
            config_hits: AtomicUsize::new(0),
            run_requests: Mutex::new(Vec::new()),
            run_auth: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            queue_mode: Mutex::new(QueueMode::Complete),
            queue_signs: Mutex::new(Vec::new()),
            queue_payloads: Mutex::new(Vec::new()),
            space_stages: Mutex::new(VecDeque::new()),
            status_polls: AtomicUsize::new(0),
            discussions_disabled: AtomicBool::new(false),
            addr: Mutex::new(None),
        }
    }
}

pub struct MockApp {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl MockApp {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_info(&self, info: Value) {
        *self.state.info.lock().unwrap() = Some(info);
    }

    pub fn set_queue_mode(&self, mode: QueueMode) {
        *self.state.queue_mode.lock().unwrap() = mode;
    }

    /// Make `/config` fail until the hub reports a running stage.
    pub fn sleep_until_running(&self, stages: &[&str]) {
        self.state.config_ready.store(false, Ordering::SeqCst);
        *self.state.space_stages.lock().unwrap() = stages.iter().map(|s| s.to_string()).collect();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// App config with one entry per `(api_name, queue)` pair.
pub fn app_config(enable_queue: bool, endpoints: &[(&str, Option<bool>)]) -> Value {
    let dependencies: Vec<Value> = endpoints
        .iter()
        .map(|(name, queue)| json!({"api_name": name, "queue": queue}))
        .collect();
    json!({
        "version": "3.40.1",
        "path": "",
        "root": "",
        "enable_queue": enable_queue,
        "dependencies": dependencies,
    })
}

pub async fn spawn(config: Value) -> MockApp {
    init_tracing();
    let state = Arc::new(MockState::new(config));
    let app = Router::new()
        .route("/config", get(config_handler))
        .route("/info", get(info_handler))
        .route("/run/{route}", post(run_handler))
        .route("/upload", post(upload_handler))
        .route("/reset", post(reset_handler))
        .route("/queue/join", get(queue_handler))
        .route("/api/spaces/{owner}/{name}", get(space_handler))
        .route("/api/spaces/{owner}/{name}/host", get(host_handler))
        .route("/api/spaces/{owner}/{name}/jwt", get(jwt_handler))
        .route("/api/spaces/{owner}/{name}/discussions", get(discussions_handler))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    *state.addr.lock().unwrap() = Some(addr);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    MockApp {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

async fn config_handler(State(state): State<Arc<MockState>>) -> Response {
    state.config_hits.fetch_add(1, Ordering::SeqCst);
    if !state.config_ready.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "asleep").into_response();
    }
    let config = state.config.lock().unwrap().clone();
    axum::Json(config).into_response()
}

async fn info_handler(State(state): State<Arc<MockState>>) -> Response {
    match state.info.lock().unwrap().clone() {
        Some(info) => axum::Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn run_handler(
    State(state): State<Arc<MockState>>,
    Path(route): Path<String>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    state
        .run_requests
        .lock()
        .unwrap()
        .push((route.clone(), body.clone()));
    state.run_auth.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    match route.as_str() {
        "fail" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": "model exploded"})),
        )
            .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            axum::Json(json!({"data": []})).into_response()
        }
        _ => axum::Json(json!({
            "data": body["data"].clone(),
            "average_duration": 0.25,
        }))
        .into_response(),
    }
}

async fn upload_handler(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    let text = String::from_utf8_lossy(&body).to_string();
    if !text.contains("name=\"files\"") {
        return (StatusCode::BAD_REQUEST, "missing files field").into_response();
    }
    let mut uploads = state.uploads.lock().unwrap();
    let handle = format!("/tmp/upload-{}", uploads.len());
    uploads.push(text);
    axum::Json(json!([handle])).into_response()
}

async fn reset_handler(
    State(state): State<Arc<MockState>>,
    axum::Json(body): axum::Json<Value>,
) -> StatusCode {
    state.resets.lock().unwrap().push(body);
    StatusCode::OK
}

async fn queue_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<MockState>>,
) -> Response {
    state
        .queue_signs
        .lock()
        .unwrap()
        .push(query.get("__sign").cloned());
    ws.on_upgrade(move |socket| run_queue(socket, state))
}

async fn send_json(socket: &mut WebSocket, frame: Value) -> bool {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .is_ok()
}

async fn recv_json(socket: &mut WebSocket) -> Option<Value> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn run_queue(mut socket: WebSocket, state: Arc<MockState>) {
    let mode = *state.queue_mode.lock().unwrap();
    if mode == QueueMode::Full {
        send_json(&mut socket, json!({"msg": "queue_full"})).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    send_json(&mut socket, json!({"msg": "send_hash"})).await;
    let Some(hash) = recv_json(&mut socket).await else {
        return;
    };
    state.queue_payloads.lock().unwrap().push(hash);

    send_json(&mut socket, json!({"msg": "send_data"})).await;
    let Some(payload) = recv_json(&mut socket).await else {
        return;
    };
    let data = payload["data"].clone();
    state.queue_payloads.lock().unwrap().push(payload);

    send_json(
        &mut socket,
        json!({"msg": "estimation", "rank": 0, "queue_size": 1, "rank_eta": 1.5}),
    )
    .await;
    send_json(&mut socket, json!({"msg": "process_starts", "rank": 1})).await;
    send_json(&mut socket, json!({"msg": "heartbeat"})).await;

    match mode {
        QueueMode::Drop => {}
        QueueMode::Fail => {
            send_json(
                &mut socket,
                json!({"msg": "process_completed", "success": false, "output": {"error": "CUDA out of memory"}}),
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
        }
        QueueMode::Complete | QueueMode::Full => {
            send_json(
                &mut socket,
                json!({
                    "msg": "process_generating",
                    "success": true,
                    "output": {"data": ["partial"]},
                    "average_duration": 0.5
                }),
            )
            .await;
            send_json(
                &mut socket,
                json!({
                    "msg": "process_completed",
                    "success": true,
                    "output": {"data": data, "average_duration": 0.5}
                }),
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
        }
    }
}

async fn space_handler(
    State(state): State<Arc<MockState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    state.status_polls.fetch_add(1, Ordering::SeqCst);
    let stage = {
        let mut stages = state.space_stages.lock().unwrap();
        if stages.len() > 1 {
            stages.pop_front()
        } else {
            stages.front().cloned()
        }
    };
    let stage = stage.unwrap_or_else(|| "RUNNING".to_string());
    if stage == "RUNNING" || stage == "RUNNING_BUILDING" {
        state.config_ready.store(true, Ordering::SeqCst);
    }
    axum::Json(json!({"id": format!("{owner}/{name}"), "runtime": {"stage": stage}})).into_response()
}

async fn host_handler(State(state): State<Arc<MockState>>) -> Response {
    let addr = state.addr.lock().unwrap().expect("server address");
    axum::Json(json!({"host": format!("http://{addr}")})).into_response()
}

async fn jwt_handler(headers: HeaderMap) -> Response {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(auth) if auth.starts_with("Bearer ") => {
            axum::Json(json!({"token": "signed-jwt"})).into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn discussions_handler(State(state): State<Arc<MockState>>) -> Response {
    if state.discussions_disabled.load(Ordering::SeqCst) {
        (
            StatusCode::FORBIDDEN,
            [("x-error-message", "Discussions are disabled for this repo")],
        )
            .into_response()
    } else {
        StatusCode::OK.into_response()
    }
}
