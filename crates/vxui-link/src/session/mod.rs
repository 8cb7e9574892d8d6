//! The session state machine: one socket, one logical session.
//!
//! All connection, authentication, correlation, and queue state lives in
//! a single owned object; a background driver task processes socket
//! events, heartbeat ticks, and handle commands one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};

use crate::config::Config;
use crate::error::LinkError;
use crate::render::{LinkEvent, NullObserver, RenderSink, StatusObserver, SwapDirectives, TargetHandle};
use crate::sandbox::{self, NoEngine, ScriptEngine, ScriptOutcome};
use crate::transport::{Connector, Transport, TransportEvent, WebSocketConnector};
use vxui_wire::{
    ClientCommand, FrameError, InboundFrame, RpcEnvelope, SandboxPolicy, ServerCommand, parse_frame,
};

pub mod backoff;

/// Close codes that trigger automatic reconnection: abnormal closure,
/// service restart, try again later.
const ABNORMAL_CLOSE_CODES: [u16; 3] = [1006, 1012, 1013];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

/// One captured submission, handed to [`Session::submit`] as an opaque
/// tuple by the capture layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub verb: String,
    pub path: String,
    pub body: Value,
    pub headers: HashMap<String, String>,
    /// Tag name of the originating element, if any.
    pub elt: Option<String>,
    pub target: TargetHandle,
    pub swap: SwapDirectives,
}

struct PendingRequest {
    verb: String,
    path: String,
    target: TargetHandle,
    swap: SwapDirectives,
    done: Option<oneshot::Sender<Result<(), LinkError>>>,
}

/// Caller-side continuation for one in-flight RPC. The response itself
/// goes to the render collaborator; the ticket only reports completion.
pub struct RpcTicket {
    pub rpc_id: u64,
    done: oneshot::Receiver<Result<(), LinkError>>,
}

impl RpcTicket {
    pub async fn finished(self) -> Result<(), LinkError> {
        self.done.await.unwrap_or(Err(LinkError::SessionClosed))
    }
}

enum Control {
    Connect,
    /// A frame was queued; drain if the gate is open.
    Pump,
    /// Normal shutdown of the socket; no reconnect.
    Close,
    /// Force an abnormal closure so the reconnect path runs.
    Recycle,
    SetHeartbeat(Duration),
}

struct SessionState {
    phase: Phase,
    auth: AuthState,
    client_id: Option<String>,
    retry_count: u32,
    pending: HashMap<u64, PendingRequest>,
    outbound: VecDeque<String>,
    policy: SandboxPolicy,
    rpc_counter: u64,
    heartbeat_interval: Duration,
}

struct Shared {
    config: Config,
    state: Mutex<SessionState>,
    ctrl_tx: mpsc::UnboundedSender<Control>,
}

/// Handle to the session. Dropping it aborts the driver task.
pub struct Session {
    shared: Arc<Shared>,
    engine: Arc<dyn ScriptEngine>,
    driver: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Spawn a session over an explicit connector and collaborators.
    pub fn spawn(
        config: Config,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn ScriptEngine>,
        render: Arc<dyn RenderSink>,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                phase: Phase::Idle,
                auth: AuthState::Unauthenticated,
                client_id: None,
                retry_count: 0,
                pending: HashMap::new(),
                outbound: VecDeque::new(),
                policy: SandboxPolicy::default(),
                rpc_counter: 0,
                heartbeat_interval: config.heartbeat_interval,
            }),
            config,
            ctrl_tx,
        });
        let runtime = Runtime {
            shared: shared.clone(),
            connector,
            engine: engine.clone(),
            render,
            observer,
        };
        let driver = tokio::spawn(runtime.run(ctrl_rx));
        Self {
            shared,
            engine,
            driver,
        }
    }

    /// Spawn over the real WebSocket endpoint from `config`, with no
    /// script engine and no status observer, and start connecting.
    pub fn open(config: Config, render: Arc<dyn RenderSink>) -> Self {
        let connector = Arc::new(WebSocketConnector::new(
            config.ws_url(),
            config.connect_timeout,
        ));
        let session = Self::spawn(
            config,
            connector,
            Arc::new(NoEngine),
            render,
            Arc::new(NullObserver),
        );
        session.connect();
        session
    }

    /// Begin connecting. No-op while a connection is open or in progress.
    pub fn connect(&self) {
        let idle = {
            let state = self.shared.state.lock().unwrap();
            state.phase == Phase::Idle
        };
        if idle {
            let _ = self.shared.ctrl_tx.send(Control::Connect);
        }
    }

    /// Tear down the socket without reconnecting.
    pub fn close(&self) {
        let _ = self.shared.ctrl_tx.send(Control::Close);
    }

    /// Recycle the connection: abnormal close followed by reconnect.
    pub fn reconnect(&self) {
        let _ = self.shared.ctrl_tx.send(Control::Recycle);
    }

    /// Associate a fresh correlation id with the submission and queue its
    /// envelope; it transmits once the socket is open and authenticated.
    pub fn submit(&self, submission: Submission) -> Result<RpcTicket, LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        let rpc_id;
        let was_idle;
        {
            let mut state = self.shared.state.lock().unwrap();
            rpc_id = allocate_rpc_id(&mut state);
            let envelope = RpcEnvelope {
                rpc_id,
                verb: submission.verb.clone(),
                path: submission.path.clone(),
                parameters: submission.body.clone(),
                body: submission.body,
                headers: submission.headers,
                elt: submission.elt,
                timestamp: now_ms(),
                token: self.shared.config.token.clone(),
            };
            let frame = serde_json::to_string(&envelope)?;
            state.pending.insert(
                rpc_id,
                PendingRequest {
                    verb: submission.verb,
                    path: submission.path,
                    target: submission.target,
                    swap: submission.swap,
                    done: Some(done_tx),
                },
            );
            state.outbound.push_back(frame);
            was_idle = state.phase == Phase::Idle;
        }
        let _ = self.shared.ctrl_tx.send(Control::Pump);
        if was_idle {
            let _ = self.shared.ctrl_tx.send(Control::Connect);
        }
        Ok(RpcTicket {
            rpc_id,
            done: done_rx,
        })
    }

    /// Run a script through the same validate/normalize path a backend
    /// `run_js` command takes. Local debugging surface.
    pub fn run_script(&self, script: &str) -> ScriptOutcome {
        let policy = self.policy();
        sandbox::execute(self.engine.as_ref(), &policy, script)
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.state.lock().unwrap().auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared.state.lock().unwrap().client_id.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().unwrap().outbound.len()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.state.lock().unwrap().retry_count
    }

    pub fn policy(&self) -> SandboxPolicy {
        self.shared.state.lock().unwrap().policy.clone()
    }

    pub fn set_policy(&self, policy: SandboxPolicy) {
        self.shared.state.lock().unwrap().policy = policy;
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.shared.state.lock().unwrap().heartbeat_interval
    }

    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.shared.state.lock().unwrap().heartbeat_interval = interval;
        let _ = self.shared.ctrl_tx.send(Control::SetHeartbeat(interval));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Epoch-millis base with a counter suffix, re-drawn while it collides
/// with a still-pending id. Collisions are a defensive check, not an
/// expected event.
fn allocate_rpc_id(state: &mut SessionState) -> u64 {
    loop {
        state.rpc_counter = state.rpc_counter.wrapping_add(1);
        let id = (now_ms() as u64) * 1000 + state.rpc_counter % 1000;
        if !state.pending.contains_key(&id) {
            return id;
        }
    }
}

enum ConnOutcome {
    /// Normal closure or explicit `close()`: back to idle.
    Normal,
    /// Abnormal closure or transport fault: reconnect with backoff.
    Abnormal,
}

struct Runtime {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    engine: Arc<dyn ScriptEngine>,
    render: Arc<dyn RenderSink>,
    observer: Arc<dyn StatusObserver>,
}

impl Runtime {
    async fn run(self, mut ctrl_rx: mpsc::UnboundedReceiver<Control>) {
        loop {
            // Idle until someone asks for a connection.
            let Some(ctrl) = ctrl_rx.recv().await else {
                return;
            };
            match ctrl {
                Control::Connect => {}
                Control::Close | Control::Pump | Control::Recycle | Control::SetHeartbeat(_) => {
                    continue;
                }
            }
            if self.connection_loop(&mut ctrl_rx).await.is_none() {
                return;
            }
            let mut state = self.shared.state.lock().unwrap();
            state.phase = Phase::Idle;
            state.auth = AuthState::Unauthenticated;
            state.client_id = None;
        }
    }

    /// Connect, drive, reconnect until a normal closure. `None` when the
    /// control channel is gone and the driver should exit.
    async fn connection_loop(&self, ctrl_rx: &mut mpsc::UnboundedReceiver<Control>) -> Option<()> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                state.phase = Phase::Connecting;
                state.auth = AuthState::Unauthenticated;
            }
            self.observer.on_event(&LinkEvent::Connecting);

            let transport = match self.connector.connect().await {
                Ok(transport) => transport,
                Err(err) => {
                    tracing::debug!(target = "link", "connect failed: {err}");
                    self.observer
                        .on_event(&LinkEvent::TransportError(err.to_string()));
                    if !self.backoff_pause(ctrl_rx).await? {
                        return Some(());
                    }
                    continue;
                }
            };

            {
                let mut state = self.shared.state.lock().unwrap();
                state.phase = Phase::Connected;
                state.retry_count = 0;
            }
            self.observer.on_event(&LinkEvent::Connected);

            let outcome = self.drive(transport.as_ref(), ctrl_rx).await;
            self.teardown();
            match outcome {
                Some(ConnOutcome::Normal) => return Some(()),
                Some(ConnOutcome::Abnormal) => {
                    if !self.backoff_pause(ctrl_rx).await? {
                        return Some(());
                    }
                }
                None => return None,
            }
        }
    }

    /// Sleep out the jittered backoff delay, staying responsive to
    /// `close()`. `Some(false)` means the reconnect was cancelled.
    async fn backoff_pause(&self, ctrl_rx: &mut mpsc::UnboundedReceiver<Control>) -> Option<bool> {
        let (delay, retry) = {
            let mut state = self.shared.state.lock().unwrap();
            let delay = backoff::next_delay(&self.shared.config.reconnect_delay, state.retry_count);
            state.retry_count += 1;
            (delay, state.retry_count)
        };
        tracing::debug!(target = "link", retry, delay_ms = delay.as_millis() as u64, "reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Some(true),
                ctrl = ctrl_rx.recv() => match ctrl {
                    None => return None,
                    Some(Control::Close) => return Some(false),
                    Some(_) => {}
                },
            }
        }
    }

    /// Event loop for one live connection.
    async fn drive(
        &self,
        transport: &dyn Transport,
        ctrl_rx: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Option<ConnOutcome> {
        // Authentication gate: with no token the session is authenticated
        // immediately and the queue opens at once.
        match self.shared.config.token.clone() {
            Some(token) => {
                self.shared.state.lock().unwrap().auth = AuthState::Authenticating;
                let auth = ClientCommand::Auth { token };
                if self.send_command(transport, &auth).await.is_err() {
                    return Some(ConnOutcome::Abnormal);
                }
                tracing::debug!(target = "link", "sent auth request");
            }
            None => {
                tracing::debug!(target = "link", "no token configured, skipping auth");
                self.shared.state.lock().unwrap().auth = AuthState::Authenticated;
                self.observer
                    .on_event(&LinkEvent::Authenticated { client_id: None });
                if self.drain_ready(transport).await.is_err() {
                    return Some(ConnOutcome::Abnormal);
                }
            }
        }

        let period = self.shared.state.lock().unwrap().heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut last_liveness = Instant::now();

        loop {
            tokio::select! {
                event = transport.recv() => match event {
                    None => return Some(ConnOutcome::Abnormal),
                    Some(TransportEvent::Frame(text)) => {
                        if let Some(outcome) =
                            self.handle_frame(transport, &text, &mut last_liveness).await
                        {
                            return Some(outcome);
                        }
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        tracing::debug!(target = "link", ?code, %reason, "websocket closed");
                        self.observer.on_event(&LinkEvent::Disconnected { code });
                        let abnormal =
                            code.map_or(true, |code| ABNORMAL_CLOSE_CODES.contains(&code));
                        return Some(if abnormal {
                            ConnOutcome::Abnormal
                        } else {
                            ConnOutcome::Normal
                        });
                    }
                },
                _ = heartbeat.tick() => {
                    if let Some(outcome) = self.heartbeat_tick(transport, &last_liveness).await {
                        return Some(outcome);
                    }
                },
                ctrl = ctrl_rx.recv() => match ctrl {
                    None => return None,
                    Some(Control::Close) => {
                        transport.close(1000, "client closed").await;
                        self.observer.on_event(&LinkEvent::Disconnected { code: Some(1000) });
                        return Some(ConnOutcome::Normal);
                    }
                    Some(Control::Recycle) => {
                        transport.close(1006, "client recycle").await;
                        return Some(ConnOutcome::Abnormal);
                    }
                    Some(Control::Pump) => {
                        if self.drain_ready(transport).await.is_err() {
                            return Some(ConnOutcome::Abnormal);
                        }
                    }
                    Some(Control::Connect) => {}
                    Some(Control::SetHeartbeat(period)) => {
                        heartbeat = interval_at(Instant::now() + period, period);
                    }
                },
            }
        }
    }

    /// Send a liveness probe, or recycle the connection when the peer has
    /// been silent past the timeout. Only active once authenticated.
    async fn heartbeat_tick(
        &self,
        transport: &dyn Transport,
        last_liveness: &Instant,
    ) -> Option<ConnOutcome> {
        let (auth, client_id) = {
            let state = self.shared.state.lock().unwrap();
            (state.auth, state.client_id.clone())
        };
        if auth != AuthState::Authenticated {
            return None;
        }
        let timeout = self.shared.config.pong_timeout;
        if last_liveness.elapsed() > timeout {
            tracing::warn!(
                target = "link",
                timeout_ms = timeout.as_millis() as u64,
                "connection stale, no liveness ack"
            );
            transport.close(1006, "connection stale").await;
            return Some(ConnOutcome::Abnormal);
        }
        let ping = ClientCommand::Ping {
            client_id,
            timestamp: now_ms(),
        };
        if self.send_command(transport, &ping).await.is_err() {
            return Some(ConnOutcome::Abnormal);
        }
        tracing::trace!(target = "link", "sent heartbeat ping");
        None
    }

    async fn send_command(
        &self,
        transport: &dyn Transport,
        command: &ClientCommand,
    ) -> Result<(), ()> {
        let frame = serde_json::to_string(command).map_err(|_| ())?;
        transport.send(frame).await.map_err(|_| ())
    }

    /// Demultiplex one inbound frame.
    async fn handle_frame(
        &self,
        transport: &dyn Transport,
        text: &str,
        last_liveness: &mut Instant,
    ) -> Option<ConnOutcome> {
        match parse_frame(text) {
            Ok(InboundFrame::Liveness) => {
                *last_liveness = Instant::now();
                None
            }
            Ok(InboundFrame::Response(response)) => {
                self.handle_response(response.rpc_id, response.data);
                None
            }
            Ok(InboundFrame::Command(command)) => {
                self.handle_command(transport, command, last_liveness).await
            }
            Err(err) => {
                self.protocol_error(&err, text);
                None
            }
        }
    }

    fn protocol_error(&self, err: &FrameError, text: &str) {
        tracing::warn!(target = "link", len = text.len(), "bad frame: {err}");
        self.observer
            .on_event(&LinkEvent::ProtocolError(err.to_string()));
    }

    fn handle_response(&self, rpc_id: u64, data: String) {
        let entry = self.shared.state.lock().unwrap().pending.remove(&rpc_id);
        let Some(mut pending) = entry else {
            tracing::debug!(target = "link", rpc_id, "no pending request for rpcID");
            return;
        };
        tracing::debug!(
            target = "link",
            rpc_id,
            verb = %pending.verb,
            path = %pending.path,
            "applying response"
        );
        self.render.apply(&pending.target, &data, &pending.swap);
        if let Some(done) = pending.done.take() {
            let _ = done.send(Ok(()));
        }
    }

    async fn handle_command(
        &self,
        transport: &dyn Transport,
        command: ServerCommand,
        last_liveness: &mut Instant,
    ) -> Option<ConnOutcome> {
        match command {
            ServerCommand::AuthOk {
                client_id,
                js_sandbox,
            } => {
                {
                    let mut state = self.shared.state.lock().unwrap();
                    state.auth = AuthState::Authenticated;
                    state.client_id = Some(client_id.clone());
                    if let Some(raw) = js_sandbox.as_deref() {
                        match SandboxPolicy::from_override(raw) {
                            Ok(policy) => state.policy = policy,
                            Err(err) => {
                                tracing::warn!(
                                    target = "link",
                                    "ignoring malformed js_sandbox override: {err}"
                                );
                            }
                        }
                    }
                }
                tracing::debug!(target = "link", %client_id, "authenticated");
                *last_liveness = Instant::now();
                self.observer.on_event(&LinkEvent::Authenticated {
                    client_id: Some(client_id),
                });
                if self.drain_ready(transport).await.is_err() {
                    return Some(ConnOutcome::Abnormal);
                }
                None
            }
            ServerCommand::RunJs { js_id, script } => {
                let policy = self.shared.state.lock().unwrap().policy.clone();
                let outcome = sandbox::execute(self.engine.as_ref(), &policy, &script);
                let reply = outcome.into_command(js_id);
                if self.send_command(transport, &reply).await.is_err() {
                    return Some(ConnOutcome::Abnormal);
                }
                None
            }
            ServerCommand::Ping { .. } => {
                // The peer's own probe proves the link is alive.
                *last_liveness = Instant::now();
                let client_id = self.shared.state.lock().unwrap().client_id.clone();
                let pong = ClientCommand::Pong {
                    client_id,
                    timestamp: now_ms(),
                };
                if self.send_command(transport, &pong).await.is_err() {
                    return Some(ConnOutcome::Abnormal);
                }
                None
            }
            ServerCommand::Pong { .. } => {
                *last_liveness = Instant::now();
                tracing::trace!(target = "link", "received pong");
                None
            }
        }
    }

    /// Drain the outbound queue in enqueue order while the socket is open
    /// and the session authenticated.
    async fn drain_ready(&self, transport: &dyn Transport) -> Result<(), ()> {
        loop {
            let frame = {
                let mut state = self.shared.state.lock().unwrap();
                if state.auth != AuthState::Authenticated {
                    return Ok(());
                }
                match state.outbound.pop_front() {
                    Some(frame) => frame,
                    None => return Ok(()),
                }
            };
            if transport.send(frame).await.is_err() {
                return Err(());
            }
        }
    }

    /// Runs after every closure, normal or not: heartbeat is already
    /// stopped (ticker dropped with the connection), pending requests
    /// resolve as failed, and untransmitted frames are discarded rather
    /// than silently retried.
    fn teardown(&self) {
        let (pending, dropped_frames) = {
            let mut state = self.shared.state.lock().unwrap();
            state.auth = AuthState::Unauthenticated;
            let pending: Vec<PendingRequest> = state.pending.drain().map(|(_, p)| p).collect();
            let dropped = state.outbound.len();
            state.outbound.clear();
            (pending, dropped)
        };
        if !pending.is_empty() || dropped_frames > 0 {
            tracing::debug!(
                target = "link",
                failed = pending.len(),
                dropped_frames,
                "failing in-flight requests after closure"
            );
        }
        for mut request in pending {
            if let Some(done) = request.done.take() {
                let _ = done.send(Err(LinkError::ConnectionLost));
            }
        }
    }
}
