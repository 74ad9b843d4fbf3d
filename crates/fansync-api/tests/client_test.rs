#![allow(clippy::unwrap_used)]
// End-to-end client behavior against in-process session and relay mocks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use fansync_api::{
    BreakerConfig, Client, ClientConfig, ConnectionState, Error, HandshakeStage, PushSource,
    PushUpdate, Status,
};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{Relay, RelayOptions};

fn status(value: serde_json::Value) -> Status {
    value.as_object().unwrap().clone()
}

/// Collect push callback invocations into a channel.
fn capture_pushes(client: &Client) -> mpsc::UnboundedReceiver<PushUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.register_push_callback(move |update| {
        let _ = tx.send(update);
    });
    rx
}

async fn connected(options: RelayOptions, tweak: impl FnOnce(&mut ClientConfig)) -> (Client, Relay, MockServer) {
    let session = common::session_server().await;
    let relay = Relay::start(options).await;
    let mut config = common::config(&session, &relay);
    tweak(&mut config);
    let client = Client::new(config, common::credentials());
    client.connect().await.unwrap();
    (client, relay, session)
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn connect_adopts_first_listed_device() {
    let options = RelayOptions {
        devices: json!([{"device": "dev-123"}, {"device": "dev-456"}]),
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |_| {}).await;

    assert_eq!(client.device_id().as_deref(), Some("dev-123"));
    assert_eq!(client.device_ids(), vec!["dev-123", "dev-456"]);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(relay.handshakes(), 1);
    assert!(client.metrics().is_connected);

    client.disconnect().await;
}

#[tokio::test]
async fn connect_twice_keeps_one_socket() {
    let (client, relay, _session) = connected(RelayOptions::default(), |_| {}).await;
    client.connect().await.unwrap();
    assert_eq!(relay.connections(), 1);
    client.disconnect().await;
}

#[tokio::test]
async fn rejected_ws_login_fails_without_retry() {
    let session = common::session_server().await;
    let relay = Relay::start(RelayOptions {
        login_status: "unauthorized",
        ..RelayOptions::default()
    })
    .await;
    let client = Client::new(common::config(&session, &relay), common::credentials());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, Error::LoginRejected { ref status } if status == "unauthorized"));
    assert_eq!(relay.connections(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn http_auth_failure_never_opens_a_socket() {
    let session = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&session)
        .await;
    let relay = Relay::start(RelayOptions::default()).await;
    let client = Client::new(common::config(&session, &relay), common::credentials());

    let err = client.connect().await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(relay.connections(), 0);
}

#[tokio::test]
async fn empty_device_list_is_retried_then_fails() {
    let session = common::session_server().await;
    let relay = Relay::start(RelayOptions {
        devices: json!([]),
        ..RelayOptions::default()
    })
    .await;
    let client = Client::new(common::config(&session, &relay), common::credentials());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake {
            stage: HandshakeStage::DeviceList,
            ..
        }
    ));
    assert_eq!(relay.connections(), 2);
    assert!(client.device_id().is_none());
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn get_status_returns_status_and_caches_profile() {
    let options = RelayOptions {
        responder: common::ok_with(json!({
            "status": {"H00": 1, "H02": 40},
            "profile": {"esh": {"model": "FS-1"}, "module": {"firmware_version": "2.0"}}
        })),
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |_| {}).await;

    let got = client.get_status(None).await.unwrap();
    assert_eq!(got, status(json!({"H00": 1, "H02": 40})));

    let profile = client.device_profile("dev-123");
    assert_eq!(profile.model.as_deref(), Some("FS-1"));
    assert_eq!(profile.firmware_version.as_deref(), Some("2.0"));

    let sent = relay.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["request"], "get");
    assert_eq!(sent[0]["device"], "dev-123");
    assert_eq!(sent[0]["id"], 3);

    let metrics = client.metrics();
    assert_eq!(metrics.total_commands, 1);
    assert_eq!(metrics.failed_commands, 0);
    client.disconnect().await;
}

#[tokio::test]
async fn set_ack_with_status_reaches_callback_exactly_once() {
    let options = RelayOptions {
        responder: common::ok_with(json!({"status": {"power": 1, "speed": 50}})),
        ..RelayOptions::default()
    };
    let (client, _relay, _session) = connected(options, |_| {}).await;
    let mut pushes = capture_pushes(&client);

    let embedded = client
        .set(None, status(json!({"power": 1})))
        .await
        .unwrap();
    let expected = status(json!({"power": 1, "speed": 50}));
    assert_eq!(embedded.as_ref(), Some(&expected));

    let update = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, expected);
    assert_eq!(update.source, PushSource::SetAck);
    assert_eq!(update.device.as_deref(), Some("dev-123"));

    let again = tokio::time::timeout(Duration::from_millis(200), pushes.recv()).await;
    assert!(again.is_err(), "callback fired more than once");
    client.disconnect().await;
}

#[tokio::test]
async fn set_records_touched_keys_per_device() {
    let options = RelayOptions {
        responder: common::ok_with(json!({})),
        ..RelayOptions::default()
    };
    let (client, _relay, _session) = connected(options, |_| {}).await;

    client
        .set(Some("dev-123"), status(json!({"H02": 40, "H00": 1})))
        .await
        .unwrap();

    let diagnostics = client.diagnostics();
    let last = &diagnostics.last_set["dev-123"];
    assert_eq!(last.keys, ["H00", "H02"]);
    assert!(last.success);
    assert_eq!(last.error_kind, None);
    assert!(diagnostics.last_get.is_empty());
    client.disconnect().await;
}

#[tokio::test]
async fn silent_relay_times_out_and_counts_it() {
    let (client, _relay, _session) = connected(RelayOptions::default(), |c| {
        c.ws_timeout = Duration::from_millis(200);
        c.timeouts_before_reconnect = 100;
    })
    .await;

    let err = client.get_status(None).await.unwrap_err();
    assert!(err.is_timeout());

    let metrics = client.metrics();
    assert_eq!(metrics.timed_out_commands, 1);
    assert_eq!(client.diagnostics().pending_requests, 0);
    client.disconnect().await;
}

#[tokio::test]
async fn rejections_open_the_breaker() {
    let options = RelayOptions {
        responder: Arc::new(|req| {
            Some(json!({"id": req["id"], "status": "error", "response": "set"}))
        }),
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |c| {
        c.breaker = BreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_attempts: 1,
        };
    })
    .await;

    for _ in 0..2 {
        let err = client.set(None, status(json!({"H00": 1}))).await.unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    }
    let err = client.set(None, status(json!({"H00": 1}))).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(relay.requests().len(), 2);
    let metrics = client.metrics();
    assert_eq!(metrics.total_commands, 3);
    assert_eq!(metrics.failed_commands, 3);
    let rejected = client.diagnostics().command_history.pop().unwrap();
    assert_eq!(rejected.error_kind, Some("circuit_open"));

    client.reset_breaker();
    let err = client.set(None, status(json!({"H00": 1}))).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { .. }));
    client.disconnect().await;
}

// ── Push and reconnect ──────────────────────────────────────────────

#[tokio::test]
async fn unsolicited_status_is_pushed() {
    let (client, relay, _session) = connected(RelayOptions::default(), |_| {}).await;
    let mut pushes = capture_pushes(&client);

    relay.push(json!({
        "event": "device_change",
        "data": {"device": "dev-123", "changes": {"status": {"H02": 75}}}
    }));

    let update = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, status(json!({"H02": 75})));
    assert_eq!(update.source, PushSource::Event);
    assert_eq!(client.metrics().push_updates_received, 1);
    client.disconnect().await;
}

#[tokio::test]
async fn push_disabled_still_routes_acks() {
    let options = RelayOptions {
        responder: common::ok_with(json!({"status": {"H00": 0}})),
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |c| c.enable_push = false).await;
    let mut pushes = capture_pushes(&client);

    relay.push(json!({"data": {"status": {"H00": 1}}}));
    assert_eq!(client.get_status(None).await.unwrap(), status(json!({"H00": 0})));

    let got = tokio::time::timeout(Duration::from_millis(200), pushes.recv()).await;
    assert!(got.is_err(), "push delivered while disabled");
    client.disconnect().await;
}

#[tokio::test]
async fn three_idle_timeouts_reconnect_once_then_pushes_flow() {
    let (client, relay, _session) = connected(RelayOptions::default(), |c| {
        c.ws_timeout = Duration::from_millis(200);
        c.timeouts_before_reconnect = 3;
    })
    .await;
    let mut pushes = capture_pushes(&client);

    // Two timeouts in: still the original socket.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(relay.handshakes(), 1);

    assert!(relay.wait_for_handshakes(2, Duration::from_secs(2)).await);
    // Let the client finish installing the new socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.metrics().websocket_reconnects, 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    relay.push(json!({"data": {"device": "dev-123", "status": {"H00": 1}}}));
    let update = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, status(json!({"H00": 1})));
    client.disconnect().await;
}

#[tokio::test]
async fn server_close_reconnects_and_requests_continue() {
    let options = RelayOptions {
        responder: common::ok_with(json!({"status": {"H00": 0}})),
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |_| {}).await;
    client.get_status(None).await.unwrap();

    relay.close_current();
    assert!(relay.wait_for_handshakes(2, Duration::from_secs(2)).await);

    let got = client.get_status(None).await.unwrap();
    assert_eq!(got, status(json!({"H00": 0})));
    assert_eq!(client.metrics().websocket_reconnects, 1);
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_interrupts_a_reconnect_handshake() {
    // Only the first login is answered, so the reconnect hangs on login.
    let options = RelayOptions {
        answered_logins: 1,
        ..RelayOptions::default()
    };
    let (client, relay, _session) = connected(options, |c| {
        c.ws_timeout = Duration::from_secs(3);
    })
    .await;

    let mut state = client.connection_state();
    relay.close_current();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let queued = tokio::spawn({
        let client = client.clone();
        async move { client.get_status(None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    client.disconnect().await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "disconnect waited {:?} for the handshake",
        started.elapsed()
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let result = tokio::time::timeout(Duration::from_secs(1), queued)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn disconnect_stops_everything() {
    let (client, _relay, _session) = connected(RelayOptions::default(), |_| {}).await;
    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.metrics().is_connected);
    let err = client.get_status(None).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}
