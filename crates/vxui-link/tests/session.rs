//! Session behavior over the mock transport pair: the test body plays
//! the backend role.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use vxui_link::sandbox::NoEngine;
use vxui_link::transport::Connector;
use vxui_link::transport::mock::{self, MockConnector};
use vxui_link::{
    AuthState, Config, LinkEvent, RenderSink, SandboxError, ScriptEngine, Session, StatusObserver,
    Submission, SwapDirectives, TargetHandle,
};
use vxui_wire::SandboxPolicy;

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<(String, String, String)>>,
}

impl RenderSink for RecordingSink {
    fn apply(&self, target: &TargetHandle, payload: &str, swap: &SwapDirectives) {
        self.applied
            .lock()
            .unwrap()
            .push((target.0.clone(), payload.to_string(), swap.style.clone()));
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<LinkEvent>>,
}

impl StatusObserver for RecordingObserver {
    fn on_event(&self, event: &LinkEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl RecordingObserver {
    fn saw_protocol_error(&self) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, LinkEvent::ProtocolError(_)))
    }
}

/// Evaluates `<int>+<int>`; `"big"` yields an 11-character string.
struct CalcEngine;

impl ScriptEngine for CalcEngine {
    fn eval(&self, script: &str, _policy: &SandboxPolicy) -> Result<Value, SandboxError> {
        if script == "big" {
            return Ok(json!("12345678901"));
        }
        let (a, b) = script
            .split_once('+')
            .ok_or_else(|| SandboxError::Execution("unsupported script".into()))?;
        let a: i64 = a.trim().parse().map_err(|_| SandboxError::Execution("bad lhs".into()))?;
        let b: i64 = b.trim().parse().map_err(|_| SandboxError::Execution("bad rhs".into()))?;
        Ok(json!(a + b))
    }
}

struct Harness {
    session: Session,
    connector: Arc<MockConnector>,
    sink: Arc<RecordingSink>,
    observer: Arc<RecordingObserver>,
}

fn quiet_config() -> Config {
    // Heartbeats far out of the way for tests that are not about them.
    Config {
        heartbeat_interval: Duration::from_secs(3600),
        pong_timeout: Duration::from_secs(7200),
        ..Config::default()
    }
}

fn harness(config: Config, engine: Arc<dyn ScriptEngine>) -> Harness {
    let connector = Arc::new(MockConnector::new());
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());
    let session = Session::spawn(
        config,
        connector.clone() as Arc<dyn Connector>,
        engine,
        sink.clone(),
        observer.clone(),
    );
    Harness {
        session,
        connector,
        sink,
        observer,
    }
}

fn submission(path: &str) -> Submission {
    Submission {
        verb: "POST".into(),
        path: path.into(),
        body: json!({"title": "buy milk"}),
        headers: HashMap::new(),
        elt: Some("FORM".into()),
        target: "t1".into(),
        swap: SwapDirectives::default(),
    }
}

async fn recv_json(peer: &mock::MockPeer) -> Value {
    let frame = peer.recv_frame().await.expect("peer frame");
    serde_json::from_str(&frame).expect("json frame")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("condition never met");
}

#[tokio::test(start_paused = true)]
async fn auth_gates_queue_and_releases_in_order() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config().with_token("tok"), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();

    let auth = recv_json(&peer).await;
    assert_eq!(auth["cmd"], "auth");
    assert_eq!(auth["token"], "tok");
    assert_eq!(h.session.auth_state(), AuthState::Authenticating);

    let _a = h.session.submit(submission("/a")).unwrap();
    let _b = h.session.submit(submission("/b")).unwrap();
    wait_until(|| h.session.queue_len() == 2).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(peer.try_recv_frame().is_none(), "sent before auth");

    peer.send_json(&json!({"cmd": "auth_ok", "client_id": "c1"}));
    let first = recv_json(&peer).await;
    let second = recv_json(&peer).await;
    assert_eq!(first["path"], "/a");
    assert_eq!(second["path"], "/b");
    assert_eq!(first["token"], "tok");
    assert_eq!(first["verb"], "POST");

    wait_until(|| h.session.is_authenticated()).await;
    assert_eq!(h.session.client_id().as_deref(), Some("c1"));
    assert_eq!(h.session.queue_len(), 0);
    let events = h.observer.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        LinkEvent::Authenticated { client_id: Some(id) } if id == "c1"
    )));
}

#[tokio::test(start_paused = true)]
async fn no_token_means_no_auth_handshake() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    let _ticket = h.session.submit(submission("/todo")).unwrap();
    let frame = recv_json(&peer).await;
    assert_eq!(frame["path"], "/todo");
    assert!(frame.get("cmd").is_none());
    assert!(frame.get("token").is_none());
}

#[tokio::test(start_paused = true)]
async fn response_applies_payload_and_resolves_ticket() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();

    let ticket = h.session.submit(submission("/todo")).unwrap();
    let frame = recv_json(&peer).await;
    let rpc_id = frame["rpcID"].as_u64().unwrap();
    assert_eq!(rpc_id, ticket.rpc_id);

    peer.send_json(&json!({"rpcID": rpc_id, "data": "<li>done</li>"}));
    ticket.finished().await.expect("rpc should resolve");
    assert_eq!(h.session.pending_count(), 0);

    let applied = h.sink.applied.lock().unwrap();
    assert_eq!(
        applied.as_slice(),
        &[("t1".to_string(), "<li>done</li>".to_string(), "innerHTML".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_rpc_id_is_dropped_quietly() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    peer.send_json(&json!({"rpcID": 424242, "data": "stale"}));

    // The session keeps working afterwards.
    let ticket = h.session.submit(submission("/after")).unwrap();
    let frame = recv_json(&peer).await;
    peer.send_json(&json!({"rpcID": frame["rpcID"], "data": "ok"}));
    ticket.finished().await.unwrap();
    assert!(!h.observer.saw_protocol_error());
    assert!(h.sink.applied.lock().unwrap().len() == 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_diagnostics_not_failures() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    peer.send_frame("{this is not json");
    wait_until(|| h.observer.saw_protocol_error()).await;

    let ticket = h.session.submit(submission("/still-alive")).unwrap();
    let frame = recv_json(&peer).await;
    peer.send_json(&json!({"rpcID": frame["rpcID"], "data": "ok"}));
    ticket.finished().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn bare_pong_frame_is_accepted() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    peer.send_frame("pong");

    let ticket = h.session.submit(submission("/ping-pong")).unwrap();
    let frame = recv_json(&peer).await;
    peer.send_json(&json!({"rpcID": frame["rpcID"], "data": "ok"}));
    ticket.finished().await.unwrap();
    assert!(!h.observer.saw_protocol_error());
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_fails_pending_and_reconnects() {
    let (first, peer1) = mock::pair();
    let (second, peer2) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(first);
    h.connector.push(second);
    h.session.connect();

    let ticket_a = h.session.submit(submission("/a")).unwrap();
    let ticket_b = h.session.submit(submission("/b")).unwrap();
    recv_json(&peer1).await;
    recv_json(&peer1).await;
    assert_eq!(h.session.pending_count(), 2);

    peer1.close(1006, "going away badly");
    assert!(matches!(ticket_a.finished().await, Err(_)));
    assert!(matches!(ticket_b.finished().await, Err(_)));
    assert_eq!(h.session.pending_count(), 0);

    wait_until(|| h.connector.attempts() == 2).await;
    wait_until(|| h.session.is_authenticated()).await;
    assert_eq!(h.session.retry_count(), 0);

    // Fresh submissions ride the new connection.
    let _ticket = h.session.submit(submission("/again")).unwrap();
    let frame = recv_json(&peer2).await;
    assert_eq!(frame["path"], "/again");
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    peer.close(1000, "bye");
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.session.auth_state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn explicit_close_tears_down_without_reconnect() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    let ticket = h.session.submit(submission("/never-answered")).unwrap();
    recv_json(&peer).await;

    h.session.close();
    assert!(matches!(ticket.finished().await, Err(_)));
    wait_until(|| peer.client_close().is_some()).await;
    assert_eq!(peer.client_close().map(|(code, _)| code), Some(1000));
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_heartbeat_recycles_the_connection() {
    let (first, peer1) = mock::pair();
    let (second, _peer2) = mock::pair();
    let config = Config {
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(60),
        ..Config::default()
    };
    let h = harness(config, Arc::new(NoEngine));
    h.connector.push(first);
    h.connector.push(second);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    // Never acknowledge: the client must give up and recycle.
    wait_until(|| peer1.client_close().is_some()).await;
    assert_eq!(peer1.client_close().map(|(code, _)| code), Some(1006));
    wait_until(|| h.connector.attempts() == 2).await;

    // It probed before giving up.
    let mut saw_ping = false;
    while let Some(frame) = peer1.try_recv_frame() {
        if let Ok(value) = serde_json::from_str::<Value>(&frame) {
            saw_ping |= value["cmd"] == "ping";
        }
    }
    assert!(saw_ping);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_heartbeats_keep_the_connection() {
    let (transport, peer) = mock::pair();
    let config = Config {
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(60),
        ..Config::default()
    };
    let h = harness(config, Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    // Answer five probes; that alone walks well past the pong timeout.
    for _ in 0..5 {
        let frame = recv_json(&peer).await;
        assert_eq!(frame["cmd"], "ping");
        peer.send_json(&json!({"cmd": "pong"}));
    }
    assert!(peer.client_close().is_none());
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_pings_are_answered_with_pongs() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config().with_token("tok"), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    recv_json(&peer).await; // auth
    peer.send_json(&json!({"cmd": "auth_ok", "client_id": "c9"}));
    wait_until(|| h.session.is_authenticated()).await;

    peer.send_json(&json!({"cmd": "ping", "timestamp": 1}));
    let pong = recv_json(&peer).await;
    assert_eq!(pong["cmd"], "pong");
    assert_eq!(pong["client_id"], "c9");
}

#[tokio::test(start_paused = true)]
async fn run_js_respects_the_policy_override() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config().with_token("tok"), Arc::new(CalcEngine));
    h.connector.push(transport);
    h.session.connect();
    recv_json(&peer).await; // auth

    let sandbox = json!({
        "enabled": true,
        "max_result_size": 10,
        "forbidden_patterns": ["eval("]
    })
    .to_string();
    peer.send_json(&json!({"cmd": "auth_ok", "client_id": "c1", "js_sandbox": sandbox}));
    wait_until(|| h.session.is_authenticated()).await;
    assert_eq!(h.session.policy().max_result_size, 10);

    peer.send_json(&json!({"cmd": "run_js", "js_id": 1, "script": "1+1"}));
    let ok = recv_json(&peer).await;
    assert_eq!(ok["cmd"], "js_result");
    assert_eq!(ok["js_id"], 1);
    assert_eq!(ok["result"], "2");
    assert_eq!(ok["error"], Value::Null);

    peer.send_json(&json!({"cmd": "run_js", "js_id": 2, "script": "eval(1)"}));
    let rejected = recv_json(&peer).await;
    assert_eq!(rejected["js_id"], 2);
    assert_eq!(rejected["result"], "");
    assert!(rejected["error"].as_str().unwrap().contains("eval("));

    peer.send_json(&json!({"cmd": "run_js", "js_id": 3, "script": "big"}));
    let oversized = recv_json(&peer).await;
    assert_eq!(oversized["js_id"], 3);
    assert_eq!(oversized["result"], "");
    assert!(oversized["error"].as_str().unwrap().contains("maximum size"));
}

#[tokio::test(start_paused = true)]
async fn malformed_policy_override_is_ignored() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config().with_token("tok"), Arc::new(CalcEngine));
    h.connector.push(transport);
    h.session.connect();
    recv_json(&peer).await; // auth

    peer.send_json(&json!({"cmd": "auth_ok", "client_id": "c1", "js_sandbox": "{broken"}));
    wait_until(|| h.session.is_authenticated()).await;
    // Defaults survive a bad override.
    assert_eq!(h.session.policy(), SandboxPolicy::default());
}

#[tokio::test(start_paused = true)]
async fn correlation_ids_are_unique_among_pending() {
    let (transport, peer) = mock::pair();
    let h = harness(quiet_config(), Arc::new(NoEngine));
    h.connector.push(transport);
    h.session.connect();
    wait_until(|| h.session.is_authenticated()).await;

    let mut ids = std::collections::HashSet::new();
    for i in 0..50 {
        let ticket = h.session.submit(submission(&format!("/n/{i}"))).unwrap();
        assert!(ids.insert(ticket.rpc_id), "duplicate id {}", ticket.rpc_id);
    }
    assert_eq!(h.session.pending_count(), 50);
    for _ in 0..50 {
        recv_json(&peer).await;
    }
}
