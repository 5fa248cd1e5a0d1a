//! In-process stand-in for the queue/log HTTP services.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// How long a stalled request hangs before answering.
const STALL: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
struct ApiState {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    refusal: Arc<Mutex<Option<(i64, String)>>>,
    stalls: Arc<Mutex<HashMap<String, u32>>>,
    next_id: Arc<AtomicU64>,
}

impl ApiState {
    fn record(&self, path: &str, body: Value) -> bool {
        self.calls.lock().unwrap().push((path.to_string(), body));
        self.failing.lock().unwrap().contains(path)
    }

    fn take_stall(&self, path: &str) -> bool {
        let mut stalls = self.stalls.lock().unwrap();
        match stalls.get_mut(path) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

async fn produce(
    State(state): State<ApiState>,
    uri: Uri,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if state.record(uri.path(), body) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
    }
    if state.take_stall(uri.path()) {
        tokio::time::sleep(STALL).await;
        return (StatusCode::GATEWAY_TIMEOUT, Json(json!({})));
    }
    if let Some((code, msg)) = state.refusal.lock().unwrap().clone() {
        return (StatusCode::OK, Json(json!({ "code": code, "msg": msg })));
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({ "code": 0, "data": { "message_id": format!("srv-{}", id) }, "msg": "ok" })),
    )
}

async fn record(State(state): State<ApiState>, uri: Uri, Json(body): Json<Value>) -> StatusCode {
    if state.record(uri.path(), body) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// Fake produce/log/error service bound to an ephemeral port.
pub struct FakeQueueApi {
    addr: SocketAddr,
    state: ApiState,
}

impl FakeQueueApi {
    pub async fn start() -> Self {
        let state = ApiState::default();
        let router = Router::new()
            .route("/queue/produce", post(produce))
            .route("/queue/reProduce", post(produce))
            .route("/queue/log", post(record))
            .route("/queue/error", post(record))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer 500 on `path` from now on.
    pub fn fail(&self, path: &str) {
        self.state.failing.lock().unwrap().insert(path.to_string());
    }

    /// Hang the next `count` produce calls on `path` longer than any client
    /// timeout used in tests.
    pub fn stall(&self, path: &str, count: u32) {
        self.state
            .stalls
            .lock()
            .unwrap()
            .insert(path.to_string(), count);
    }

    /// Answer produce calls with a non-zero code.
    pub fn refuse_produce(&self, code: i64, msg: &str) {
        *self.state.refusal.lock().unwrap() = Some((code, msg.to_string()));
    }

    /// Bodies received on `path`, in order.
    pub fn calls_to(&self, path: &str) -> Vec<Value> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

/// URL of a port nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
