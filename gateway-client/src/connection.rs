//! Connection manager: the single task that owns the socket.
//!
//! Connection state, the pending-call map, the advertised method set and the
//! backoff counter all live on this task. Callers reach it through
//! [`Command`]s and observe it through a `watch` channel of [`GatewayStatus`].

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::GatewayConfig;
use crate::correlator::{CallReply, Correlator};
use crate::error::GatewayError;
use crate::frame::{Frame, PushEvent};
use crate::handshake::{Handshake, HandshakePhase, HandshakeStep};
use crate::transport::{Connector, Inbound, Outbound, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Health snapshot published by the connection task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub configured: bool,
    pub state: ConnectionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_close: Option<CloseInfo>,
    pub methods: Vec<String>,
    pub server_version: Option<String>,
    pub reconnect_attempts: u32,
    pub next_retry_in_ms: Option<u64>,
    /// The handshake watchdog fired on the current socket before it became ready.
    pub handshake_stalled: bool,
}

impl GatewayStatus {
    pub(crate) fn initial(configured: bool) -> Self {
        Self {
            configured,
            state: ConnectionState::Disconnected,
            connected: false,
            last_error: None,
            last_close: None,
            methods: Vec::new(),
            server_version: None,
            reconnect_attempts: 0,
            next_retry_in_ms: None,
            handshake_stalled: false,
        }
    }

    pub fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

pub(crate) enum Command {
    Call {
        method: String,
        params: Value,
        timeout: Duration,
        reply: CallReply,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

enum SessionEnd {
    Lost,
    Stopped(Option<oneshot::Sender<()>>),
}

enum ConnectOutcome {
    Open(Transport),
    Failed(GatewayError),
    Stopped(Option<oneshot::Sender<()>>),
}

pub(crate) struct ConnectionManager {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<GatewayStatus>,
    events: mpsc::UnboundedSender<PushEvent>,
    correlator: Correlator,
    handshake: Handshake,
    backoff: Backoff,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<GatewayStatus>,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_floor(), config.backoff_ceiling());
        Self {
            config,
            connector,
            commands,
            status,
            events,
            correlator: Correlator::new(),
            handshake: Handshake::new(),
            backoff,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            url = self.config.endpoint().unwrap_or_default(),
            "gateway connection task started"
        );

        loop {
            let transport = match self.connect().await {
                ConnectOutcome::Open(transport) => transport,
                ConnectOutcome::Failed(err) => {
                    warn!("gateway connect failed: {}", err);
                    self.status.send_modify(|s| s.last_error = Some(err.to_string()));
                    if !self.wait_before_retry().await {
                        return;
                    }
                    continue;
                }
                ConnectOutcome::Stopped(done) => {
                    self.finish(done);
                    return;
                }
            };

            match self.run_session(transport).await {
                SessionEnd::Lost => {
                    if !self.wait_before_retry().await {
                        return;
                    }
                }
                SessionEnd::Stopped(done) => {
                    self.finish(done);
                    return;
                }
            }
        }
    }

    async fn connect(&mut self) -> ConnectOutcome {
        self.set_state(ConnectionState::Connecting);
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let attempt = connector.connect(&config);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => ConnectOutcome::Open(transport),
                        Err(err) => ConnectOutcome::Failed(err),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(GatewayError::NotConnected));
                    }
                    Some(Command::Stop { done }) => return ConnectOutcome::Stopped(Some(done)),
                    None => return ConnectOutcome::Stopped(None),
                },
            }
        }
    }

    async fn run_session(&mut self, mut transport: Transport) -> SessionEnd {
        self.handshake = Handshake::new();
        self.status.send_modify(|s| s.handshake_stalled = false);
        self.set_state(ConnectionState::AwaitingChallenge);

        let watchdog = sleep(self.config.handshake_watchdog());
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;

        loop {
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                inbound = transport.inbound.recv() => match inbound {
                    Some(Inbound::Text(text)) => {
                        if let Some(end) = self.on_text(&text, &transport.outbound) {
                            return end;
                        }
                    }
                    Some(Inbound::Closed { code, reason }) => {
                        info!(code, reason = %reason, "gateway socket closed");
                        self.status.send_modify(|s| {
                            s.last_close = Some(CloseInfo { code, reason: reason.clone() });
                        });
                        return self.on_lost();
                    }
                    Some(Inbound::Error(err)) => {
                        warn!("gateway socket error: {}", err);
                        self.status.send_modify(|s| s.last_error = Some(err.clone()));
                        return self.on_lost();
                    }
                    None => {
                        self.status.send_modify(|s| {
                            s.last_error = Some(GatewayError::ConnectionLost.to_string());
                        });
                        return self.on_lost();
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Call { method, params, timeout, reply }) => {
                        if !self.send_call(method, params, timeout, reply, &transport.outbound) {
                            return self.on_lost();
                        }
                    }
                    Some(Command::Stop { done }) => {
                        let _ = transport.outbound.send(Outbound::Close);
                        return SessionEnd::Stopped(Some(done));
                    }
                    None => {
                        let _ = transport.outbound.send(Outbound::Close);
                        return SessionEnd::Stopped(None);
                    }
                },
                _ = sleep_until_deadline(deadline) => {
                    self.correlator.expire(Instant::now());
                }
                _ = &mut watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    self.on_watchdog();
                }
            }
        }
    }

    /// Route one text frame: correlator first, then handshake, then push.
    fn on_text(
        &mut self,
        text: &str,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) -> Option<SessionEnd> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping malformed gateway frame: {}", err);
                return None;
            }
        };

        if let Frame::Res {
            id,
            ok,
            payload,
            error,
        } = &frame
        {
            if self
                .correlator
                .resolve(id, *ok, payload.clone(), error.as_ref())
            {
                return None;
            }
        }

        match self.handshake.on_frame(&frame, &self.config) {
            HandshakeStep::Send(connect) => {
                let sent = connect
                    .to_text()
                    .map(|text| outbound.send(Outbound::Text(text)).is_ok());
                match sent {
                    Ok(true) => None,
                    Ok(false) => Some(self.on_lost()),
                    Err(err) => {
                        warn!("failed to encode connect request: {}", err);
                        None
                    }
                }
            }
            HandshakeStep::Ready => {
                self.backoff.reset();
                let methods = self.handshake.methods();
                let server_version = self.handshake.server_version().map(String::from);
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Ready;
                    s.connected = true;
                    s.last_error = None;
                    s.methods = methods;
                    s.server_version = server_version;
                    s.reconnect_attempts = 0;
                    s.next_retry_in_ms = None;
                    s.handshake_stalled = false;
                });
                None
            }
            HandshakeStep::Rejected(err) => {
                self.status.send_modify(|s| s.last_error = Some(err.to_string()));
                let _ = outbound.send(Outbound::Close);
                Some(self.on_lost())
            }
            HandshakeStep::Consumed => None,
            HandshakeStep::Ignored => {
                match frame {
                    Frame::Event {
                        event,
                        payload,
                        seq,
                    } => {
                        let push = PushEvent {
                            event,
                            payload,
                            seq,
                        };
                        if let Err(err) = self.events.send(push) {
                            debug!("no push subscriber, dropping '{}'", err.0.event);
                        }
                    }
                    Frame::Res { id, .. } => debug!(id = %id, "dropping unmatched gateway reply"),
                    Frame::Req { method, .. } => {
                        debug!(method = %method, "ignoring request from gateway")
                    }
                }
                None
            }
        }
    }

    /// Gate, register and write one call. Returns `false` when the socket is gone.
    fn send_call(
        &mut self,
        method: String,
        params: Value,
        timeout: Duration,
        reply: CallReply,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        if !self.handshake.is_ready() {
            let _ = reply.send(Err(GatewayError::NotConnected));
            return true;
        }
        if !self.handshake.supports(&method) {
            let _ = reply.send(Err(GatewayError::UnsupportedMethod(method)));
            return true;
        }

        let id = self.correlator.register(&method, timeout, reply);
        let text = match Frame::request(id.clone(), method.clone(), params).to_text() {
            Ok(text) => text,
            Err(err) => {
                self.correlator.fail(&id, err);
                return true;
            }
        };

        if outbound.send(Outbound::Text(text)).is_err() {
            return false;
        }
        debug!(method = %method, id = %id, "gateway call sent");
        true
    }

    fn on_watchdog(&self) {
        match self.handshake.phase() {
            HandshakePhase::AwaitingChallenge => warn!(
                after_ms = self.config.handshake_watchdog_ms,
                "no challenge or ready signal from gateway yet"
            ),
            HandshakePhase::AwaitingHello => {
                debug!("gateway challenge answered, still waiting for hello")
            }
            HandshakePhase::Ready => return,
        }
        self.status.send_modify(|s| s.handshake_stalled = true);
    }

    fn on_lost(&mut self) -> SessionEnd {
        let rejected = self.correlator.reject_all(GatewayError::ConnectionLost);
        if rejected > 0 {
            warn!(rejected, "gateway connection lost with calls in flight");
        }
        self.handshake = Handshake::new();
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected = false;
            s.methods.clear();
        });
        SessionEnd::Lost
    }

    /// Sleep out the backoff delay. Returns `false` if the client was stopped meanwhile.
    async fn wait_before_retry(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected = false;
            s.reconnect_attempts = s.reconnect_attempts.saturating_add(1);
            s.next_retry_in_ms = Some(delay.as_millis() as u64);
        });
        info!(delay_ms = delay.as_millis() as u64, "gateway reconnect scheduled");

        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(GatewayError::NotConnected));
                    }
                    Some(Command::Stop { done }) => {
                        self.finish(Some(done));
                        return false;
                    }
                    None => {
                        self.finish(None);
                        return false;
                    }
                },
            }
        }
    }

    fn finish(&mut self, done: Option<oneshot::Sender<()>>) {
        self.correlator.reject_all(GatewayError::Stopped);
        self.handshake = Handshake::new();
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected = false;
            s.methods.clear();
            s.next_retry_in_ms = None;
        });
        info!("gateway client stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    pub(crate) fn publish(&self, update: impl FnOnce(&mut GatewayStatus)) {
        self.status.send_modify(update);
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| {
            s.state = state;
            s.connected = state == ConnectionState::Ready;
        });
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
