//! Mission Desk gateway client
//!
//! Resilient client for the agent gateway: one persistent WebSocket, a
//! versioned challenge/response handshake, many concurrent correlated calls,
//! push-event fan-out and reconnect with exponential backoff.
//!
//! ```no_run
//! # async fn demo() -> Result<(), missiondesk_gateway::GatewayError> {
//! use missiondesk_gateway::{GatewayClient, GatewayConfig};
//!
//! let client = GatewayClient::websocket(GatewayConfig::with_url("ws://127.0.0.1:18789"));
//! let mut events = client.take_events().expect("first subscriber");
//! client.start();
//! client.ready().await?;
//! let status = client.call("status", serde_json::json!({})).await?;
//! # let _ = (status, events.recv().await);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod transport;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Command, ConnectionManager};

pub use crate::config::{load_file_config, ClientIdentity, GatewayConfig};
pub use crate::connection::{CloseInfo, ConnectionState, GatewayStatus};
pub use crate::error::{GatewayError, GatewayResult};
pub use crate::frame::{Frame, PushEvent};
pub use crate::handshake::PROTOCOL_VERSION;
pub use crate::transport::{Connector, Inbound, Outbound, Transport, WsConnector};

const COMMAND_BUFFER: usize = 256;

/// Handle to the gateway connection task.
///
/// The handle holds no connection state of its own: calls are forwarded to
/// the task and the status is read from its `watch` channel.
pub struct GatewayClient {
    config: GatewayConfig,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<GatewayStatus>,
    idle: Mutex<Option<ConnectionManager>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PushEvent>>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) =
            watch::channel(GatewayStatus::initial(config.endpoint().is_some()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager =
            ConnectionManager::new(config.clone(), connector, command_rx, status_tx, event_tx);

        Self {
            config,
            commands: command_tx,
            status: status_rx,
            idle: Mutex::new(Some(manager)),
            task: Mutex::new(None),
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Client over a real WebSocket.
    pub fn websocket(config: GatewayConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Push events from the gateway. Only the first caller gets the receiver.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PushEvent>> {
        lock(&self.events).take()
    }

    /// Spawn the connection task. Without a configured url this only records
    /// the degraded state. Returns `true` when a task was spawned.
    pub fn start(&self) -> bool {
        if self.config.endpoint().is_none() {
            warn!("gateway url not configured; running without gateway");
            self.idle_status(|s| {
                s.configured = false;
                s.last_error = Some(GatewayError::NotConfigured.to_string());
            });
            return false;
        }

        let Some(manager) = lock(&self.idle).take() else {
            debug!("gateway client already started");
            return false;
        };
        *lock(&self.task) = Some(tokio::spawn(manager.run()));
        true
    }

    /// Close the socket, cancel any pending reconnect and reject pending calls.
    pub async fn stop(&self) {
        let handle = lock(&self.task).take();
        let Some(handle) = handle else {
            lock(&self.idle).take();
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Stop { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
        if let Err(err) = handle.await {
            warn!("gateway connection task ended abnormally: {}", err);
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.status.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().state == ConnectionState::Ready
    }

    /// Whether the last handshake advertised `method`.
    pub fn supports(&self, method: &str) -> bool {
        self.status.borrow().supports(method)
    }

    /// Wait until the handshake completes. Callers bound this with their own timeout.
    pub async fn ready(&self) -> GatewayResult<()> {
        if self.config.endpoint().is_none() {
            return Err(GatewayError::NotConfigured);
        }
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == ConnectionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::Stopped)
    }

    /// Call `method` with the configured request timeout.
    pub async fn call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        self.call_with_timeout(method, params, self.config.request_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> GatewayResult<Value> {
        {
            let status = self.status.borrow();
            if status.state != ConnectionState::Ready {
                return Err(GatewayError::NotConnected);
            }
            if !status.supports(method) {
                return Err(GatewayError::UnsupportedMethod(method.to_string()));
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                method: method.to_string(),
                params,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GatewayError::Stopped)?;

        reply_rx.await.unwrap_or(Err(GatewayError::ConnectionLost))
    }

    fn idle_status(&self, update: impl FnOnce(&mut GatewayStatus)) {
        if let Some(manager) = lock(&self.idle).as_ref() {
            manager.publish(update);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
