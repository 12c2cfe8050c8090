use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use missiondesk_gateway::{
    ConnectionState, Connector, GatewayClient, GatewayConfig, GatewayError, GatewayResult,
    Inbound, Outbound, Transport, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Gateway side of one fake socket.
struct FakeSocket {
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl FakeSocket {
    fn push(&self, value: Value) {
        self.to_client
            .send(Inbound::Text(value.to_string()))
            .expect("client reader alive");
    }

    fn push_raw(&self, text: &str) {
        self.to_client
            .send(Inbound::Text(text.to_string()))
            .expect("client reader alive");
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    async fn next_frame(&mut self) -> Value {
        match timeout(Duration::from_secs(5), self.from_client.recv()).await {
            Ok(Some(Outbound::Text(text))) => serde_json::from_str(&text).expect("json frame"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Answer the challenge/connect exchange and return the connect params.
    async fn handshake(&mut self, methods: &[&str]) -> Value {
        self.push(json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": {"nonce": "nonce-1", "ts": 1}
        }));
        let connect = self.next_frame().await;
        assert_eq!(connect["type"], "req");
        assert_eq!(connect["method"], "connect");
        self.push(json!({
            "type": "res",
            "id": connect["id"],
            "ok": true,
            "payload": {
                "type": "hello-ok",
                "features": {"methods": methods},
                "server": {"version": "test"}
            }
        }));
        connect["params"].clone()
    }

    fn reply(&self, request: &Value, payload: Value) {
        self.push(json!({"type": "res", "id": request["id"], "ok": true, "payload": payload}));
    }
}

struct FakeConnector {
    sockets: mpsc::UnboundedSender<FakeSocket>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _config: &GatewayConfig) -> GatewayResult<Transport> {
        self.attempts.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.sockets.send(FakeSocket {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Transport::new(out_tx, in_rx))
    }
}

struct Harness {
    client: Arc<GatewayClient>,
    sockets: mpsc::UnboundedReceiver<FakeSocket>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    refuse: Arc<AtomicBool>,
}

impl Harness {
    fn new(config: GatewayConfig) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let refuse = Arc::new(AtomicBool::new(false));
        let connector = FakeConnector {
            sockets: socket_tx,
            attempts: Arc::clone(&attempts),
            refuse: Arc::clone(&refuse),
        };
        Self {
            client: Arc::new(GatewayClient::new(config, Arc::new(connector))),
            sockets: socket_rx,
            attempts,
            refuse,
        }
    }

    fn configured() -> Self {
        let mut config = GatewayConfig::with_url("ws://gateway.test");
        config.token = Some("secret".into());
        Self::new(config)
    }

    async fn next_socket(&mut self) -> FakeSocket {
        timeout(Duration::from_secs(120), self.sockets.recv())
            .await
            .expect("connect attempt")
            .expect("connector alive")
    }

    async fn ready_socket(&mut self, methods: &[&str]) -> FakeSocket {
        self.client.start();
        let mut socket = self.next_socket().await;
        socket.handshake(methods).await;
        timeout(Duration::from_secs(5), self.client.ready())
            .await
            .expect("ready in time")
            .expect("ready");
        socket
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[tokio::test]
async fn start_without_endpoint_is_degraded_noop() {
    let harness = Harness::new(GatewayConfig::default());

    assert!(!harness.client.start());
    let status = harness.client.status();
    assert!(!status.configured);
    assert!(!status.connected);
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_error.as_deref(), Some("gateway url not configured"));

    sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.attempt_count(), 0);
    assert_eq!(
        harness.client.call("agent", json!({})).await,
        Err(GatewayError::NotConnected)
    );
    assert_eq!(harness.client.ready().await, Err(GatewayError::NotConfigured));
}

#[tokio::test]
async fn handshake_advertises_supported_methods() {
    let mut harness = Harness::configured();
    harness.client.start();
    let mut socket = harness.next_socket().await;
    assert_eq!(harness.client.status().state, ConnectionState::AwaitingChallenge);

    let params = socket.handshake(&["agent"]).await;
    assert_eq!(params["minProtocol"], json!(PROTOCOL_VERSION));
    assert_eq!(params["maxProtocol"], json!(PROTOCOL_VERSION));
    assert_eq!(params["auth"]["token"], "secret");
    assert_eq!(params["auth"]["nonce"], "nonce-1");

    timeout(Duration::from_secs(5), harness.client.ready())
        .await
        .expect("ready in time")
        .expect("ready");
    assert!(harness.client.supports("agent"));
    assert!(!harness.client.supports("chat.send"));

    let status = harness.client.status();
    assert!(status.connected);
    assert_eq!(status.server_version.as_deref(), Some("test"));
}

#[tokio::test]
async fn calls_before_ready_fail_immediately() {
    let mut harness = Harness::configured();
    harness.client.start();
    let mut socket = harness.next_socket().await;

    assert_eq!(
        harness.client.call("agent", json!({})).await,
        Err(GatewayError::NotConnected)
    );
    assert!(socket.from_client.try_recv().is_err());
}

#[tokio::test]
async fn unsupported_method_sends_no_frame() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    assert_eq!(
        harness.client.call("chat.send", json!({"message": "hi"})).await,
        Err(GatewayError::UnsupportedMethod("chat.send".into()))
    );
    assert!(socket.from_client.try_recv().is_err(), "no frame may be written");

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move { client.call("agent", json!({"x": 1})).await });
    let request = socket.next_frame().await;
    assert_eq!(request["method"], "agent");
    socket.reply(&request, json!({"runId": "run-1"}));
    assert_eq!(call.await.unwrap(), Ok(json!({"runId": "run-1"})));
}

#[tokio::test]
async fn concurrent_calls_are_correlated_by_id() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let mut calls = Vec::new();
    for n in 0..3 {
        let client = Arc::clone(&harness.client);
        calls.push(tokio::spawn(async move {
            client.call("agent", json!({"n": n})).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(socket.next_frame().await);
    }
    // Answer in reverse order; each caller must get its own payload.
    for request in requests.iter().rev() {
        socket.reply(request, json!({"echo": request["params"]["n"]}));
    }

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), Ok(json!({"echo": n})));
    }
}

#[tokio::test]
async fn remote_error_is_returned_to_the_caller() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move { client.call("agent", json!({})).await });
    let request = socket.next_frame().await;
    socket.push(json!({
        "type": "res",
        "id": request["id"],
        "ok": false,
        "error": {"code": "INVALID_REQUEST", "message": "session key mismatch"}
    }));

    assert_eq!(
        call.await.unwrap(),
        Err(GatewayError::remote(
            Some("INVALID_REQUEST".into()),
            "session key mismatch"
        ))
    );
}

#[tokio::test]
async fn unbounded_call_timeout_keeps_the_connection_alive() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move {
        client
            .call_with_timeout("agent", json!({"n": 1}), Duration::MAX)
            .await
    });
    let request = socket.next_frame().await;
    assert_eq!(request["params"]["n"], 1);
    socket.reply(&request, json!({"runId": "run-1"}));
    assert_eq!(call.await.unwrap(), Ok(json!({"runId": "run-1"})));
    assert!(harness.client.is_ready());

    let client = Arc::clone(&harness.client);
    let follow_up = tokio::spawn(async move { client.call("agent", json!({"n": 2})).await });
    let request = socket.next_frame().await;
    socket.reply(&request, json!({"runId": "run-2"}));
    assert_eq!(follow_up.await.unwrap(), Ok(json!({"runId": "run-2"})));
    assert_eq!(harness.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_naming_the_method() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move {
        client
            .call_with_timeout("agent", json!({}), Duration::from_millis(200))
            .await
    });
    let request = socket.next_frame().await;

    let result = call.await.unwrap();
    assert_eq!(
        result,
        Err(GatewayError::Timeout {
            method: "agent".into(),
            timeout: Duration::from_millis(200),
        })
    );

    // A late reply is dropped without disturbing the connection.
    socket.reply(&request, json!({}));
    sleep(Duration::from_millis(10)).await;
    assert!(harness.client.is_ready());
}

#[tokio::test(start_paused = true)]
async fn disconnect_rejects_every_pending_call_once() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let mut calls = Vec::new();
    for _ in 0..5 {
        let client = Arc::clone(&harness.client);
        calls.push(tokio::spawn(async move {
            client.call("agent", json!({})).await
        }));
    }
    for _ in 0..5 {
        socket.next_frame().await;
    }

    socket.close(1012, "restart");
    for call in calls {
        assert_eq!(call.await.unwrap(), Err(GatewayError::ConnectionLost));
    }

    let status = harness.client.status();
    assert!(!status.connected);
    assert!(status.methods.is_empty());
    let close = status.last_close.expect("close recorded");
    assert_eq!(close.code, 1012);
    assert_eq!(close.reason, "restart");

    // The client comes back on its own after the backoff floor.
    let mut again = harness.next_socket().await;
    again.handshake(&["agent"]).await;
    timeout(Duration::from_secs(5), harness.client.ready())
        .await
        .expect("ready in time")
        .expect("ready again");
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_to_ceiling_and_resets_after_handshake() {
    let mut harness = Harness::configured();
    harness.refuse.store(true, Ordering::SeqCst);
    harness.client.start();

    while harness.attempt_count() < 8 {
        sleep(Duration::from_millis(100)).await;
    }
    let expected_secs = [1u64, 2, 4, 8, 16, 30, 30];
    {
        let attempts = harness.attempts.lock().unwrap();
        for (window, expected) in attempts.windows(2).zip(expected_secs) {
            let gap = window[1] - window[0];
            let diff = gap.as_millis() as i64 - (expected * 1_000) as i64;
            assert!(diff.abs() <= 5, "expected ~{expected}s gap, got {gap:?}");
        }
    }
    assert_eq!(harness.client.status().reconnect_attempts, 8);

    // Let the next attempt through and complete a handshake.
    harness.refuse.store(false, Ordering::SeqCst);
    let mut socket = harness.next_socket().await;
    socket.handshake(&["agent"]).await;
    timeout(Duration::from_secs(5), harness.client.ready())
        .await
        .expect("ready in time")
        .expect("ready");
    assert_eq!(harness.client.status().reconnect_attempts, 0);

    // Dropping the socket now must retry after the floor delay, not the ceiling.
    let before = harness.attempt_count();
    let lost_at = Instant::now();
    socket.close(1006, "gone");
    let _socket = harness.next_socket().await;
    assert_eq!(harness.attempt_count(), before + 1);
    let gap = *harness.attempts.lock().unwrap().last().unwrap() - lost_at;
    assert!(gap <= Duration::from_millis(1_005), "gap {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn handshake_rejection_schedules_reconnect() {
    let mut harness = Harness::configured();
    harness.client.start();
    let mut socket = harness.next_socket().await;

    socket.push(json!({"type": "event", "event": "connect.challenge", "payload": {}}));
    let connect = socket.next_frame().await;
    socket.push(json!({
        "type": "res",
        "id": connect["id"],
        "ok": false,
        "error": {"code": "UNAUTHORIZED", "message": "bad token"}
    }));

    match timeout(Duration::from_secs(5), socket.from_client.recv()).await {
        Ok(Some(Outbound::Close)) => {}
        other => panic!("expected close after rejection, got {other:?}"),
    }
    let status = harness.client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("bad token"));

    let _retry = harness.next_socket().await;
    assert_eq!(harness.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_challenge_still_completes_after_watchdog() {
    let mut harness = Harness::configured();
    harness.client.start();
    let mut socket = harness.next_socket().await;

    sleep(Duration::from_secs(3)).await;
    assert!(!harness.client.status().handshake_stalled);

    // Past the 5s watchdog: flagged and logged, the socket stays open.
    sleep(Duration::from_secs(5)).await;
    let status = harness.client.status();
    assert!(status.handshake_stalled);
    assert_eq!(status.state, ConnectionState::AwaitingChallenge);

    socket.handshake(&["agent"]).await;
    timeout(Duration::from_secs(5), harness.client.ready())
        .await
        .expect("ready in time")
        .expect("ready");
    assert!(!harness.client.status().handshake_stalled);
    assert_eq!(harness.attempt_count(), 1);
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_pushes_forwarded() {
    let mut harness = Harness::configured();
    let mut events = harness.client.take_events().expect("event receiver");
    assert!(harness.client.take_events().is_none());
    let mut socket = harness.ready_socket(&["agent"]).await;

    socket.push_raw("{this is not json");
    socket.push(json!({
        "type": "event",
        "event": "agent",
        "payload": {"runId": "run-9", "stream": "lifecycle", "data": {"phase": "start"}},
        "seq": 7
    }));

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.event, "agent");
    assert_eq!(event.seq, Some(7));
    assert_eq!(event.payload["runId"], "run-9");
    assert!(harness.client.is_ready());

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move { client.call("agent", json!({})).await });
    let request = socket.next_frame().await;
    socket.reply(&request, json!({"ok": true}));
    assert!(call.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn stop_rejects_pending_and_never_reconnects() {
    let mut harness = Harness::configured();
    let mut socket = harness.ready_socket(&["agent"]).await;

    let client = Arc::clone(&harness.client);
    let call = tokio::spawn(async move { client.call("agent", json!({})).await });
    socket.next_frame().await;

    harness.client.stop().await;
    assert_eq!(call.await.unwrap(), Err(GatewayError::Stopped));
    match timeout(Duration::from_secs(1), socket.from_client.recv()).await {
        Ok(Some(Outbound::Close)) | Ok(None) => {}
        other => panic!("expected socket close, got {other:?}"),
    }

    sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.attempt_count(), 1);
    assert_eq!(harness.client.status().state, ConnectionState::Disconnected);
    assert_eq!(
        harness.client.call("agent", json!({})).await,
        Err(GatewayError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cancels_the_timer() {
    let mut harness = Harness::configured();
    harness.refuse.store(true, Ordering::SeqCst);
    harness.client.start();

    while harness.attempt_count() < 2 {
        sleep(Duration::from_millis(50)).await;
    }
    harness.client.stop().await;
    let attempts = harness.attempt_count();

    sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.attempt_count(), attempts);
}
