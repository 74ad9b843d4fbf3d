//! End-to-end runs of the `fansync` binary against an in-process relay.
#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use assert_cmd::cargo::cargo_bin_cmd;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEVICE: &str = "dev-123";

type Fan = Arc<Mutex<Map<String, Value>>>;

// ── Simulated account ───────────────────────────────────────────────

async fn session(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api:1/session"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"token": "tok-1"})))
        .mount(&server)
        .await;
    server
}

/// A relay fronting one fan that applies writes and echoes its status.
async fn relay(initial: Value) -> (String, Fan) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fan: Fan = Arc::new(Mutex::new(initial.as_object().unwrap().clone()));

    let shared = Arc::clone(&fan);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let fan = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let req: Value = serde_json::from_str(text.as_str()).unwrap();
                    if let Some(reply) = answer(&fan, &req) {
                        if ws.send(Message::text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    (format!("ws://{addr}/api:1/phone"), fan)
}

fn answer(fan: &Fan, req: &Value) -> Option<Value> {
    let ok = |data: Value| {
        json!({"id": req["id"], "status": "ok", "response": req["request"], "data": data})
    };
    match req["request"].as_str()? {
        "login" => Some(json!({"id": req["id"], "status": "ok", "response": "login"})),
        "lst_device" => Some(ok(
            json!([{"device": DEVICE, "properties": {"displayName": "Porch"}}]),
        )),
        "get" => Some(ok(json!({"status": *fan.lock().unwrap()}))),
        "set" => {
            let mut status = fan.lock().unwrap();
            if let Some(fields) = req["data"].as_object() {
                status.extend(fields.clone());
            }
            Some(ok(json!({"status": *status})))
        }
        _ => None,
    }
}

fn write_config(home: &Path, session: &MockServer, ws_url: &str) {
    let dir = home.join("fansync");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.toml"),
        format!(
            "[profiles.default]\n\
             email = \"user@example.com\"\n\
             password = \"hunter2\"\n\
             session_url = \"{}/api:1/session\"\n\
             ws_url = \"{ws_url}\"\n\
             ws_timeout = 2\n\
             confirm_attempts = 5\n\
             confirm_delay_ms = 20\n",
            session.uri()
        ),
    )
    .unwrap();
}

/// Run the binary off the runtime so the relay keeps serving.
async fn run(home: &Path, args: &[&str]) -> std::process::Output {
    let home = home.to_path_buf();
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    tokio::task::spawn_blocking(move || {
        cargo_bin_cmd!("fansync")
            .env("HOME", &home)
            .env("XDG_CONFIG_HOME", &home)
            .env_remove("FANSYNC_PROFILE")
            .env_remove("FANSYNC_DEVICE")
            .env_remove("FANSYNC_OUTPUT")
            .env_remove("FANSYNC_EMAIL")
            .env_remove("FANSYNC_PASSWORD")
            .args(&args)
            .output()
            .unwrap()
    })
    .await
    .unwrap()
}

fn stdout_json(output: &std::process::Output) -> Value {
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_fan_state() {
    let home = tempfile::tempdir().unwrap();
    let session = session(200).await;
    let (ws_url, _fan) = relay(json!({"H00": 1, "H02": 45, "H06": 1, "H0B": 0})).await;
    write_config(home.path(), &session, &ws_url);

    let out = stdout_json(&run(home.path(), &["-o", "json", "status"]).await);
    assert_eq!(out["device"], DEVICE);
    assert_eq!(out["state"]["is_on"], true);
    assert_eq!(out["state"]["percentage"], 45);
    assert_eq!(out["state"]["direction"], "reverse");
    assert_eq!(out["pending"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn devices_lists_display_names() {
    let home = tempfile::tempdir().unwrap();
    let session = session(200).await;
    let (ws_url, _fan) = relay(json!({"H00": 0})).await;
    write_config(home.path(), &session, &ws_url);

    let output = run(home.path(), &["devices"]).await;
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains(DEVICE) && text.contains("Porch"), "{text}");
}

#[tokio::test(flavor = "multi_thread")]
async fn speed_write_is_confirmed() {
    let home = tempfile::tempdir().unwrap();
    let session = session(200).await;
    let (ws_url, fan) = relay(json!({"H00": 0, "H02": 20, "H01": 1})).await;
    write_config(home.path(), &session, &ws_url);

    let out = stdout_json(&run(home.path(), &["-o", "json", "speed", "70"]).await);
    assert_eq!(out["command"], "set_percentage");
    assert_eq!(out["outcome"], "confirmed");
    assert_eq!(out["state"]["percentage"], 70);

    let status = fan.lock().unwrap().clone();
    assert_eq!(status["H00"], 1);
    assert_eq!(status["H02"], 70);
    assert_eq!(status["H01"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn light_level_is_sent_as_percent() {
    let home = tempfile::tempdir().unwrap();
    let session = session(200).await;
    let (ws_url, fan) = relay(json!({"H0B": 0, "H0C": 10})).await;
    write_config(home.path(), &session, &ws_url);

    let out = stdout_json(&run(home.path(), &["-o", "json", "light", "on", "--level", "255"]).await);
    assert_eq!(out["command"], "light_on");
    assert_eq!(out["outcome"], "confirmed");

    let status = fan.lock().unwrap().clone();
    assert_eq!(status["H0B"], 1);
    assert_eq!(status["H0C"], 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_device_exits_not_found() {
    let home = tempfile::tempdir().unwrap();
    let session = session(200).await;
    let (ws_url, _fan) = relay(json!({})).await;
    write_config(home.path(), &session, &ws_url);

    let output = run(home.path(), &["--device", "dev-999", "off"]).await;
    assert_eq!(output.status.code(), Some(4));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_login_exits_auth() {
    let home = tempfile::tempdir().unwrap();
    let session = session(401).await;
    let (ws_url, _fan) = relay(json!({})).await;
    write_config(home.path(), &session, &ws_url);

    let output = run(home.path(), &["status"]).await;
    assert_eq!(output.status.code(), Some(3));
}
