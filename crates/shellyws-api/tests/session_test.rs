//! Integration tests for the session lifecycle against a scripted
//! in-process WebSocket device.
//!
//! Each test plays the device side over a real socket: accept the
//! connection, serve the priming status fetch, then follow the scenario
//! script. Timing is shrunk so reconnect/timeout scenarios stay fast.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use shellyws_api::{ConnectionState, DeviceConfig, DimmerClient, Error, SessionTiming, probe};

// ── Scripted device ─────────────────────────────────────────────────

struct Device {
    ws: WebSocketStream<TcpStream>,
}

impl Device {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("tcp accept");
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws handshake");
        Self { ws }
    }

    /// Next inbound request, skipping keepalive frames.
    async fn recv_request(&mut self) -> Value {
        loop {
            let message = self
                .ws
                .next()
                .await
                .expect("client closed early")
                .expect("ws read");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).expect("request JSON"),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Expect no further inbound request within `window`. The client
    /// closing the connection counts as silence.
    async fn expect_no_request(&mut self, window: Duration) {
        let outcome = tokio::time::timeout(window, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await;
        if let Ok(Some(text)) = outcome {
            panic!("expected no request, got {text}");
        }
    }

    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("ws send");
    }

    async fn reply_ok(&mut self, id: u64, result: Value) {
        self.send_json(json!({"id": id, "src": "device", "result": result}))
            .await;
    }

    async fn reply_error(&mut self, id: u64, code: i64, message: &str) {
        self.send_json(json!({
            "id": id, "src": "device",
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    /// Serve the status fetch the session issues right after connecting.
    async fn serve_prime(&mut self) {
        let request = self.recv_request().await;
        assert_eq!(request["method"], "Shelly.GetStatus");
        let id = request["id"].as_u64().expect("request id");
        self.reply_ok(id, full_status()).await;
    }

    async fn drop_connection(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn full_status() -> Value {
    json!({
        "light:0": {"id": 0, "output": true, "brightness": 65.0},
        "pm1:0": {
            "id": 0,
            "apower": 12.4,
            "voltage": 231.2,
            "current": 0.054,
            "aenergy": {"total": 1534.2}
        }
    })
}

fn fast_timing() -> SessionTiming {
    SessionTiming {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_millis(400),
        reconnect_interval: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(60),
    }
}

async fn listener() -> (TcpListener, DeviceConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let config = DeviceConfig::new(addr.ip().to_string()).with_port(addr.port());
    (listener, config)
}

async fn wait_for_state(client: &DimmerClient, want: ConnectionState, timeout: Duration) {
    let mut state_rx = client.watch_state();
    let reached = tokio::time::timeout(timeout, async {
        loop {
            if *state_rx.borrow_and_update() == want {
                return;
            }
            if state_rx.changed().await.is_err() {
                // Sender gone; the last value is final.
                assert_eq!(*state_rx.borrow(), want, "session ended in wrong state");
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "state {want:?} not reached in {timeout:?}");
}

// ── Connect & prime ─────────────────────────────────────────────────

#[tokio::test]
async fn connects_primes_cache_and_serves_commands() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;

    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    // The prime response lands in the cache.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let state = client.status().await.unwrap();
        if state.power == Some(true) {
            assert_eq!(state.brightness, Some(65));
            assert_eq!(state.power_w, Some(12.4));
            assert_eq!(state.energy_wh, Some(1534.2));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cache never primed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Command round-trip over the same connection.
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.set_brightness(40).await })
    };
    let request = device.recv_request().await;
    assert_eq!(request["method"], "Light.Set");
    assert_eq!(request["params"]["brightness"], 40);
    assert_eq!(request["params"]["id"], 0);
    assert_eq!(request["src"], "shellyws");
    device
        .reply_ok(request["id"].as_u64().unwrap(), json!({}))
        .await;
    call.await.unwrap().unwrap();

    client.shutdown();
    wait_for_state(&client, ConnectionState::Disconnected, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn notifications_apply_in_arrival_order() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();
    // Subscribe before the prime response exists so its change is seen too.
    let mut changes = client.subscribe();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    device
        .send_json(json!({
            "src": "device", "dst": "shellyws", "method": "NotifyStatus",
            "params": {"light:0": {"brightness": 20.0}}
        }))
        .await;
    device
        .send_json(json!({
            "src": "device", "dst": "shellyws", "method": "NotifyStatus",
            "params": {"light:0": {"output": false}, "pm1:0": {"apower": 0.0}}
        }))
        .await;
    device
        .send_json(json!({
            "src": "device", "dst": "shellyws", "method": "NotifyStatus",
            "params": {"light:0": {"brightness": 80.0}}
        }))
        .await;

    // Prime change may arrive first; collect until the last scripted one.
    let mut brightness_seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let change = tokio::time::timeout_at(deadline, changes.recv())
            .await
            .expect("changes stalled")
            .expect("subscription alive");
        if let Some(b) = change.brightness {
            brightness_seen.push(b);
        }
        if change.brightness == Some(80) {
            break;
        }
    }
    assert_eq!(brightness_seen, vec![65, 20, 80], "order not preserved");

    // The cache equals the fold of the deltas.
    let state = client.status().await.unwrap();
    assert_eq!(state.power, Some(false));
    assert_eq!(state.brightness, Some(80));
    assert_eq!(state.power_w, Some(0.0));

    client.shutdown();
}

#[tokio::test]
async fn restart_event_notification_is_surfaced() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let mut changes = client.subscribe();
    device
        .send_json(json!({
            "src": "device", "dst": "shellyws", "method": "NotifyEvent",
            "params": {"events": [{"component": "sys", "event": "scheduled_restart"}]}
        }))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let change = tokio::time::timeout_at(deadline, changes.recv())
            .await
            .expect("changes stalled")
            .expect("subscription alive");
        if change.restart {
            break;
        }
    }

    client.shutdown();
}

// ── Not-connected behavior ──────────────────────────────────────────

#[tokio::test]
async fn commands_fail_fast_while_not_connected() {
    // Bind then drop: connection refused, session loops in reconnect.
    let (listener, config) = listener().await;
    drop(listener);

    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.set_power(true).await.expect_err("not connected");
    assert!(matches!(err, Error::NotConnected), "got {err:?}");

    let err = client.status().await.expect_err("not connected");
    assert!(matches!(err, Error::NotConnected), "got {err:?}");

    client.shutdown();
}

#[tokio::test]
async fn out_of_range_brightness_sends_nothing() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let err = client.set_brightness(150).await.expect_err("out of range");
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");

    // No frame reaches the wire.
    device.expect_no_request(Duration::from_millis(300)).await;

    client.shutdown();
}

// ── Disconnect & reconnect ──────────────────────────────────────────

#[tokio::test]
async fn disconnect_fails_pending_then_reconnects_at_fixed_interval() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    // Three callers left hanging when the transport drops.
    let pending: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.set_power(true).await })
        })
        .collect();
    for _ in 0..3 {
        device.recv_request().await;
    }

    let dropped_at = tokio::time::Instant::now();
    device.drop_connection().await;

    // Every pending caller is resolved with ConnectionLost, none hang.
    for handle in pending {
        let err = handle.await.unwrap().expect_err("pending failed");
        assert!(matches!(err, Error::ConnectionLost), "got {err:?}");
    }

    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(1)).await;

    // The session comes back on its own after the fixed delay.
    let mut device = Device::accept(&listener).await;
    let elapsed = dropped_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250),
        "reconnected after only {elapsed:?}"
    );
    device.serve_prime().await;
    wait_for_state(&client, ConnectionState::Connected, Duration::from_secs(2)).await;

    client.shutdown();
}

#[tokio::test]
async fn repeated_failures_keep_retrying() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    // Refuse the websocket handshake a few times in a row.
    for _ in 0..3 {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    }

    // Still trying, never gave up: a real device now completes the dance.
    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    wait_for_state(&client, ConnectionState::Connected, Duration::from_secs(5)).await;

    client.shutdown();
}

#[tokio::test]
async fn shutdown_cancels_pending_reconnect() {
    let (listener, config) = listener().await;
    drop(listener);

    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.shutdown();
    wait_for_state(&client, ConnectionState::Disconnected, Duration::from_secs(2)).await;

    // No retry fires after shutdown.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

// ── Request timeout ─────────────────────────────────────────────────

#[tokio::test]
async fn unanswered_request_times_out_exactly_once() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.set_power(true).await })
    };
    let request = device.recv_request().await;
    let id = request["id"].as_u64().unwrap();

    // Never answer: the sweep fails the caller.
    let err = call.await.unwrap().expect_err("timed out");
    assert!(matches!(err, Error::RequestTimeout { .. }), "got {err:?}");

    // A late reply is a stale id: ignored, connection stays up.
    device.reply_ok(id, json!({"late": true})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.shutdown();
}

#[tokio::test]
async fn stray_response_id_is_ignored() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    // Snapshot only after the prime landed, so later reads compare
    // against a settled cache.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let before = loop {
        let state = client.status().await.unwrap();
        if state.power.is_some() {
            break state;
        }
        assert!(tokio::time::Instant::now() < deadline, "cache never primed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    device
        .reply_ok(9999, json!({"light:0": {"brightness": 1.0}}))
        .await;
    device.send_json(json!({"totally": "unrelated"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Unchanged cache, no error surfaced anywhere, still connected.
    assert_eq!(client.status().await.unwrap(), before);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.shutdown();
}

// ── Authentication ──────────────────────────────────────────────────

fn challenge_message() -> String {
    json!({"realm": "shellydimmerg3-aabbcc", "nonce": 1700000000_u64, "algorithm": "SHA-256"})
        .to_string()
}

#[tokio::test]
async fn auth_challenge_is_answered_and_session_connects() {
    let (listener, config) = listener().await;
    let config = config.with_credentials("admin", "hunter2".to_string().into());
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;

    // Challenge the priming status fetch.
    let first = device.recv_request().await;
    assert_eq!(first["method"], "Shelly.GetStatus");
    assert!(first.get("auth").is_none());
    device
        .reply_error(first["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    // The resubmission carries the digest response.
    let resubmitted = device.recv_request().await;
    assert_eq!(resubmitted["method"], "Shelly.GetStatus");
    let auth = &resubmitted["auth"];
    assert_eq!(auth["realm"], "shellydimmerg3-aabbcc");
    assert_eq!(auth["username"], "admin");
    assert_eq!(auth["nonce"], "1700000000");
    assert_eq!(auth["algorithm"], "SHA-256");
    assert_eq!(auth["response"].as_str().unwrap().len(), 64);
    device
        .reply_ok(resubmitted["id"].as_u64().unwrap(), full_status())
        .await;

    // The resubmitted prime landing in the cache proves the negotiation
    // settled; only then are commands serviced again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if client.is_connected() {
            if let Ok(state) = client.status().await {
                if state.power.is_some() {
                    break;
                }
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "negotiation never settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Subsequent commands reuse the negotiated auth.
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.set_power(false).await })
    };
    let command = device.recv_request().await;
    assert_eq!(command["method"], "Light.Set");
    assert!(command.get("auth").is_some());
    device
        .reply_ok(command["id"].as_u64().unwrap(), json!({}))
        .await;
    call.await.unwrap().unwrap();

    client.shutdown();
}

#[tokio::test]
async fn challenge_without_credentials_is_terminal() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    let first = device.recv_request().await;
    device
        .reply_error(first["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    // No resubmission, no auth retry loop.
    device.expect_no_request(Duration::from_millis(300)).await;
    wait_for_state(&client, ConnectionState::AuthFailed, Duration::from_secs(2)).await;

    // No reconnect attempt either: the listener stays quiet.
    let no_retry = tokio::time::timeout(Duration::from_millis(700), listener.accept()).await;
    assert!(no_retry.is_err(), "session reconnected after terminal auth failure");

    let err = client.set_power(true).await.expect_err("terminal");
    assert!(matches!(err, Error::AuthFailed), "got {err:?}");

    client.shutdown();
}

#[tokio::test]
async fn credentials_rejected_twice_is_terminal() {
    let (listener, config) = listener().await;
    let config = config.with_credentials("admin", "wrong".to_string().into());
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;

    // Initial challenge, then reject the digest twice.
    let first = device.recv_request().await;
    device
        .reply_error(first["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    let retry1 = device.recv_request().await;
    assert!(retry1.get("auth").is_some());
    device
        .reply_error(retry1["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    let retry2 = device.recv_request().await;
    assert!(retry2.get("auth").is_some());
    device
        .reply_error(retry2["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    device.expect_no_request(Duration::from_millis(300)).await;
    wait_for_state(&client, ConnectionState::AuthFailed, Duration::from_secs(2)).await;

    let err = client.set_brightness(10).await.expect_err("terminal");
    assert!(matches!(err, Error::AuthFailed), "got {err:?}");

    client.shutdown();
}

#[tokio::test]
async fn unanswered_auth_resubmission_reconnects_instead_of_wedging() {
    let (listener, config) = listener().await;
    let config = config.with_credentials("admin", "hunter2".to_string().into());
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    let first = device.recv_request().await;
    device
        .reply_error(first["id"].as_u64().unwrap(), 401, &challenge_message())
        .await;

    // Swallow the digest resubmission and keep the socket open.
    let resubmitted = device.recv_request().await;
    assert!(resubmitted.get("auth").is_some());

    // The sweep gives up on the stalled negotiation: the session must
    // re-enter the reconnect path, not sit in Authenticating refusing
    // every command forever.
    wait_for_state(&client, ConnectionState::Reconnecting, Duration::from_secs(2)).await;

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    wait_for_state(&client, ConnectionState::Connected, Duration::from_secs(2)).await;

    // Commands are serviced again on the fresh connection.
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.set_power(true).await })
    };
    let request = device.recv_request().await;
    assert_eq!(request["method"], "Light.Set");
    device
        .reply_ok(request["id"].as_u64().unwrap(), json!({}))
        .await;
    call.await.unwrap().unwrap();

    client.shutdown();
}

// ── Restart ─────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_tolerates_the_expected_connection_drop() {
    let (listener, config) = listener().await;
    let client = DimmerClient::connect_with_timing(config, fast_timing()).unwrap();

    let mut device = Device::accept(&listener).await;
    device.serve_prime().await;
    client
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.restart().await })
    };
    let request = device.recv_request().await;
    assert_eq!(request["method"], "Shelly.Reboot");

    // The device reboots without answering: accepted, not an error.
    device.drop_connection().await;
    call.await.unwrap().expect("restart treated as accepted");

    client.shutdown();
}

// ── Probe ───────────────────────────────────────────────────────────

#[tokio::test]
async fn probe_reports_device_identity() {
    let (listener, config) = listener().await;

    let serve = tokio::spawn(async move {
        let mut device = Device::accept(&listener).await;
        let request = device.recv_request().await;
        assert_eq!(request["method"], "Shelly.GetDeviceInfo");
        device
            .reply_ok(
                request["id"].as_u64().unwrap(),
                json!({"id": "shellydimmerg3-aabbcc", "model": "S3DM-0010WW", "auth_en": false}),
            )
            .await;
    });

    let info = probe(&config, Duration::from_secs(2)).await.unwrap();
    assert_eq!(info.id.as_deref(), Some("shellydimmerg3-aabbcc"));
    assert_eq!(info.model.as_deref(), Some("S3DM-0010WW"));
    assert!(!info.auth_required);
    serve.await.unwrap();
}

#[tokio::test]
async fn probe_treats_auth_challenge_as_reachable() {
    let (listener, config) = listener().await;

    let serve = tokio::spawn(async move {
        let mut device = Device::accept(&listener).await;
        let request = device.recv_request().await;
        device
            .reply_error(request["id"].as_u64().unwrap(), 401, &challenge_message())
            .await;
    });

    let info = probe(&config, Duration::from_secs(2)).await.unwrap();
    assert!(info.auth_required);
    assert!(info.id.is_none());
    serve.await.unwrap();
}

#[tokio::test]
async fn probe_fails_within_the_bound_when_unreachable() {
    let (listener, config) = listener().await;
    drop(listener);

    let err = probe(&config, Duration::from_millis(500))
        .await
        .expect_err("unreachable");
    assert!(matches!(err, Error::ConnectionFailed { .. }), "got {err:?}");
}
