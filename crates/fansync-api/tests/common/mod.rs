//! In-process stand-ins for the FanSync cloud: wiremock for the HTTP
//! session endpoint and a scripted tokio-tungstenite relay.
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fansync_api::{ClientConfig, Credentials, RetryPolicy};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SESSION_PATH: &str = "/api:1/session";

/// Answers a post-handshake request, or stays silent with `None`.
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub fn silent() -> Responder {
    Arc::new(|_| None)
}

/// Echo an ok ack for every request, embedding `data`.
pub fn ok_with(data: Value) -> Responder {
    Arc::new(move |req| {
        Some(json!({
            "id": req["id"],
            "status": "ok",
            "response": req["request"],
            "data": data,
        }))
    })
}

pub struct RelayOptions {
    pub devices: Value,
    pub login_status: &'static str,
    /// Logins answered before the relay goes quiet on login.
    pub answered_logins: usize,
    pub responder: Responder,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            devices: json!([{"device": "dev-123", "properties": {"displayName": "Bedroom"}}]),
            login_status: "ok",
            answered_logins: usize::MAX,
            responder: silent(),
        }
    }
}

struct RelayState {
    options: RelayOptions,
    connections: AtomicUsize,
    logins: AtomicUsize,
    handshakes: AtomicUsize,
    requests: Mutex<Vec<Value>>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Scripted WebSocket relay: answers login and the device list, records
/// every other request, and lets tests push frames or drop the socket.
pub struct Relay {
    pub url: Url,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn start(options: RelayOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState {
            options,
            connections: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            handshakes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            current: Mutex::new(None),
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

    /// Sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Device lists served so far (one per completed handshake).
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    /// Send a frame on the most recent socket.
    pub fn push(&self, frame: Value) {
        if let Some(tx) = self.state.current.lock().as_ref() {
            let _ = tx.send(Message::text(frame.to_string()));
        }
    }

    /// Close the most recent socket from the server side.
    pub fn close_current(&self) {
        if let Some(tx) = self.state.current.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Poll until `handshakes()` reaches `n` or `within` elapses.
    pub async fn wait_for_handshakes(&self, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.handshakes() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.handshakes() >= n
    }
}

async fn serve(tcp: TcpStream, state: Arc<RelayState>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.current.lock() = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
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
        let reply = match req["request"].as_str() {
            Some("login") => {
                let seen = state.logins.fetch_add(1, Ordering::SeqCst);
                (seen < state.options.answered_logins).then(|| {
                    json!({
                        "id": req["id"],
                        "status": state.options.login_status,
                        "response": "login",
                    })
                })
            }
            Some("lst_device") => {
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                Some(json!({
                    "id": req["id"],
                    "status": "ok",
                    "response": "lst_device",
                    "data": state.options.devices,
                }))
            }
            _ => {
                state.requests.lock().push(req.clone());
                (state.options.responder)(&req)
            }
        };
        if let Some(reply) = reply {
            let _ = tx.send(Message::text(reply.to_string()));
        }
    }
    writer.abort();
}

/// Session endpoint that hands out a fixed token.
pub async fn session_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&server)
        .await;
    server
}

pub fn credentials() -> Credentials {
    Credentials {
        email: "user@example.com".into(),
        password: SecretString::from("hunter2".to_string()),
    }
}

/// Client config pointed at the mocks, with short waits.
pub fn config(session: &MockServer, relay: &Relay) -> ClientConfig {
    ClientConfig {
        session_url: Url::parse(&format!("{}{SESSION_PATH}", session.uri())).unwrap(),
        ws_url: relay.url.clone(),
        ws_timeout: Duration::from_millis(500),
        http_timeout: Duration::from_secs(5),
        handshake_retry: RetryPolicy::fixed(2, Duration::ZERO),
        reconnect_backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(50)),
        ..ClientConfig::default()
    }
}
