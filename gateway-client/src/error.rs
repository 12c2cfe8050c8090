//! Error taxonomy for the gateway client.
//!
//! Connection-level failures never reach a caller directly; they surface as a
//! rejected pending call (`ConnectionLost`). Request-level failures carry the
//! remote `code` so higher layers can classify them.

use std::time::Duration;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// No gateway URL was configured; the client runs in degraded mode.
    #[error("gateway url not configured")]
    NotConfigured,

    /// The handshake has not completed; calls are never queued.
    #[error("gateway not connected")]
    NotConnected,

    /// The method is missing from the advertised `features.methods` set.
    #[error("gateway does not support method '{0}'")]
    UnsupportedMethod(String),

    #[error("gateway call '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("gateway connection lost")]
    ConnectionLost,

    #[error("gateway client stopped")]
    Stopped,

    /// The gateway answered with `ok: false`.
    #[error("{}", display_remote(.code.as_deref(), .message))]
    Remote {
        code: Option<String>,
        message: String,
    },

    #[error("gateway handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    #[error("gateway transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn remote(code: Option<String>, message: impl Into<String>) -> Self {
        GatewayError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Remote error code, when the gateway supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::Remote { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True for failures caused by the socket going away rather than by the call.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectionLost | GatewayError::NotConnected | GatewayError::Stopped
        )
    }
}

fn display_remote(code: Option<&str>, message: &str) -> String {
    match code {
        Some(code) => format!("gateway error [{code}]: {message}"),
        None => format!("gateway error: {message}"),
    }
}
