//! Challenge → authenticated connect → ready.
//!
//! The coordinator is a pure state machine: the connection task feeds it
//! inbound frames and writes whatever frame it asks for.

use std::collections::BTreeSet;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::frame::{remote_error, Frame, CHALLENGE_EVENT, CONNECT_METHOD, HELLO_OK};

type HmacSha256 = Hmac<Sha256>;

/// Gateway protocol version implemented by this client (sent as both min and max).
pub const PROTOCOL_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    AwaitingChallenge,
    AwaitingHello,
    Ready,
}

/// What the connection task should do after a frame was offered.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Write this connect request.
    Send(Frame),
    /// `hello-ok` received; the gate is open.
    Ready,
    /// The gateway refused the connect request.
    Rejected(GatewayError),
    /// Handshake frame with nothing further to do.
    Consumed,
    /// Not a handshake frame.
    Ignored,
}

#[derive(Debug)]
pub struct Handshake {
    phase: HandshakePhase,
    connect_id: Option<String>,
    methods: BTreeSet<String>,
    server_version: Option<String>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            phase: HandshakePhase::AwaitingChallenge,
            connect_id: None,
            methods: BTreeSet::new(),
            server_version: None,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == HandshakePhase::Ready
    }

    pub fn supports(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().cloned().collect()
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn on_frame(&mut self, frame: &Frame, config: &GatewayConfig) -> HandshakeStep {
        match frame {
            Frame::Event { event, payload, .. } if event == CHALLENGE_EVENT => {
                self.on_challenge(payload, config)
            }
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } if self.connect_id.as_deref() == Some(id.as_str()) => {
                self.connect_id = None;
                self.on_connect_reply(*ok, payload.as_ref(), error.as_ref())
            }
            _ => HandshakeStep::Ignored,
        }
    }

    fn on_challenge(&mut self, challenge: &Value, config: &GatewayConfig) -> HandshakeStep {
        if self.phase == HandshakePhase::Ready {
            debug!("ignoring connect challenge on a ready connection");
            return HandshakeStep::Consumed;
        }

        let id = Uuid::new_v4().to_string();
        let params = connect_params(config, challenge);
        debug!(id = %id, "answering gateway challenge");
        self.connect_id = Some(id.clone());
        self.phase = HandshakePhase::AwaitingHello;
        HandshakeStep::Send(Frame::request(id, CONNECT_METHOD, params))
    }

    fn on_connect_reply(
        &mut self,
        ok: bool,
        payload: Option<&Value>,
        error: Option<&Value>,
    ) -> HandshakeStep {
        if !ok {
            let reason = remote_error(error).to_string();
            warn!("gateway rejected connect: {}", reason);
            return HandshakeStep::Rejected(GatewayError::HandshakeRejected(reason));
        }

        let payload = payload.cloned().unwrap_or(Value::Null);
        if payload.get("type").and_then(|v| v.as_str()) != Some(HELLO_OK) {
            return HandshakeStep::Rejected(GatewayError::HandshakeRejected(format!(
                "expected {HELLO_OK} reply, got {payload}"
            )));
        }

        self.methods = payload
            .pointer("/features/methods")
            .and_then(|v| v.as_array())
            .map(|methods| {
                methods
                    .iter()
                    .filter_map(|m| m.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        self.server_version = payload
            .pointer("/server/version")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.phase = HandshakePhase::Ready;

        info!(
            methods = self.methods.len(),
            server = self.server_version.as_deref().unwrap_or("unknown"),
            "gateway handshake complete"
        );
        HandshakeStep::Ready
    }
}

/// Parameters of the authenticated connect request.
pub fn connect_params(config: &GatewayConfig, challenge: &Value) -> Value {
    let mut auth = Map::new();
    if let Some(token) = config.token.as_deref() {
        auth.insert("token".into(), Value::String(token.to_string()));

        if let Some(nonce) = challenge.get("nonce").and_then(|v| v.as_str()) {
            auth.insert("nonce".into(), Value::String(nonce.to_string()));
            if let Some(signature) = sign_challenge(token, nonce, &config.client.id) {
                auth.insert("signature".into(), Value::String(signature));
            }
        }
    }

    json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": {
            "id": config.client.id,
            "displayName": config.client.display_name,
            "version": config.client.version,
            "platform": config.client.platform,
            "mode": config.client.mode,
        },
        "role": config.role,
        "scopes": config.scopes,
        "auth": Value::Object(auth),
    })
}

/// `base64(HMAC-SHA256(token, "<nonce>|<client id>"))`
pub fn sign_challenge(token: &str, nonce: &str, client_id: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes()).ok()?;
    mac.update(format!("{nonce}|{client_id}").as_bytes());
    Some(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}
