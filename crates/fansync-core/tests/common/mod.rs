//! A simulated FanSync account: wiremock session endpoint plus a
//! tokio-tungstenite relay fronting one fan whose status lives in memory.
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use fansync_core::{ClientConfig, ControllerConfig, Credentials, RetryPolicy, Status};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const DEVICE: &str = "dev-123";
const SESSION_PATH: &str = "/api:1/session";

/// How the simulated fan reacts to writes.
#[derive(Debug, Clone, Copy)]
pub struct FanBehavior {
    /// Embed the post-write status in the set ack.
    pub embed_status: bool,
    /// Apply writes to the fan's status.
    pub apply_sets: bool,
    /// Answer writes with a non-ok status.
    pub reject_sets: bool,
}

impl Default for FanBehavior {
    fn default() -> Self {
        Self {
            embed_status: true,
            apply_sets: true,
            reject_sets: false,
        }
    }
}

struct FanState {
    behavior: FanBehavior,
    status: Mutex<Status>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    quiet: AtomicBool,
}

pub struct FakeFan {
    pub url: Url,
    state: Arc<FanState>,
}

impl FakeFan {
    pub async fn start(initial: Value, behavior: FanBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(FanState {
            behavior,
            status: Mutex::new(initial.as_object().unwrap().clone()),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            current: Mutex::new(None),
            quiet: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(serve(tcp, Arc::clone(&accept_state)));
            }
        });

        Self {
            url: Url::parse(&format!("ws://{addr}/api:1/phone")).unwrap(),
            state,
        }
    }

    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.state.sets.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        self.state.status.lock().clone()
    }

    /// Change the fan from outside (wall switch, other app) and push it.
    pub fn change(&self, fields: Value) {
        let fields = fields.as_object().unwrap().clone();
        self.state.status.lock().extend(fields.clone());
        self.push(json!({
            "event": "device_change",
            "data": {"device": DEVICE, "changes": {"status": fields}},
        }));
    }

    pub fn push(&self, frame: Value) {
        if let Some(tx) = self.state.current.lock().as_ref() {
            let _ = tx.send(Message::text(frame.to_string()));
        }
    }

    /// Stop answering `get` requests.
    pub fn go_quiet(&self) {
        self.state.quiet.store(true, Ordering::SeqCst);
    }
}

async fn serve(tcp: TcpStream, state: Arc<FanState>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.current.lock() = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(req) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if let Some(reply) = answer(&state, &req) {
            let _ = tx.send(Message::text(reply.to_string()));
        }
    }
    writer.abort();
}

fn answer(state: &FanState, req: &Value) -> Option<Value> {
    let ok = |data: Value| {
        json!({"id": req["id"], "status": "ok", "response": req["request"], "data": data})
    };
    match req["request"].as_str()? {
        "login" => Some(json!({"id": req["id"], "status": "ok", "response": "login"})),
        "lst_device" => Some(ok(json!([{"device": DEVICE, "properties": {"displayName": "Bedroom"}}]))),
        "get" => {
            state.gets.fetch_add(1, Ordering::SeqCst);
            if state.quiet.load(Ordering::SeqCst) {
                return None;
            }
            Some(ok(json!({"status": *state.status.lock()})))
        }
        "set" => {
            state.sets.fetch_add(1, Ordering::SeqCst);
            let behavior = state.behavior;
            if behavior.reject_sets {
                return Some(json!({"id": req["id"], "status": "error", "response": "set"}));
            }
            if behavior.apply_sets {
                if let Some(fields) = req["data"].as_object() {
                    state.status.lock().extend(fields.clone());
                }
            }
            if behavior.embed_status {
                Some(ok(json!({"status": *state.status.lock()})))
            } else {
                Some(json!({"id": req["id"], "status": "ok", "response": "set"}))
            }
        }
        _ => None,
    }
}

pub async fn session_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&server)
        .await;
    server
}

/// Controller config pointed at the mocks, with short waits.
pub fn config(session: &MockServer, fan: &FakeFan) -> ControllerConfig {
    let mut config = ControllerConfig::new(Credentials {
        email: "user@example.com".into(),
        password: SecretString::from("hunter2".to_string()),
    });
    config.client = ClientConfig {
        session_url: Url::parse(&format!("{}{SESSION_PATH}", session.uri())).unwrap(),
        ws_url: fan.url.clone(),
        ws_timeout: Duration::from_millis(500),
        http_timeout: Duration::from_secs(5),
        handshake_retry: RetryPolicy::fixed(2, Duration::ZERO),
        reconnect_backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(50)),
        ..ClientConfig::default()
    };
    config.confirm = RetryPolicy::fixed(5, Duration::from_millis(20));
    config.fallback_poll = None;
    config
}
