//! Wire envelope for the gateway socket.
//!
//! Every frame is a JSON text message tagged by `type`:
//! `req` (outbound call), `res` (reply to a call) and `event` (push).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Event name the gateway uses to open the handshake.
pub const CHALLENGE_EVENT: &str = "connect.challenge";
/// Method name of the authenticated connect request.
pub const CONNECT_METHOD: &str = "connect";
/// `payload.type` of a successful connect reply.
pub const HELLO_OK: &str = "hello-ok";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Frame::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Parse one text frame. Malformed JSON and unknown `type` tags are both
    /// protocol-level errors; callers log and drop them.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|err| GatewayError::Protocol(err.to_string()))
    }

    pub fn to_text(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|err| GatewayError::Protocol(err.to_string()))
    }

    /// Correlation id for `req`/`res` frames.
    pub fn id(&self) -> Option<&str> {
        match self {
            Frame::Req { id, .. } | Frame::Res { id, .. } => Some(id),
            Frame::Event { .. } => None,
        }
    }
}

/// A push event handed to the downstream pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub payload: Value,
    pub seq: Option<u64>,
}

/// Build the error for a `res` frame with `ok: false`.
///
/// The gateway sends either `{code, message}` or a bare string.
pub fn remote_error(error: Option<&Value>) -> GatewayError {
    match error {
        Some(Value::String(message)) => GatewayError::remote(None, message.clone()),
        Some(Value::Object(map)) => {
            let code = map.get("code").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            let message = map
                .get("message")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string());
            GatewayError::remote(code, message)
        }
        Some(other) => GatewayError::remote(None, other.to_string()),
        None => GatewayError::remote(None, "request failed"),
    }
}
