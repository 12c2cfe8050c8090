//! Gateway client configuration.
//!
//! The client itself never reads the environment: callers build a
//! [`GatewayConfig`] (usually through [`load_file_config`] plus
//! [`GatewayConfig::apply_env`] in a binary) and inject it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_WATCHDOG_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_FLOOR_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;

pub const ENV_URL: &str = "MISSIONDESK_GATEWAY_URL";
pub const ENV_TOKEN: &str = "MISSIONDESK_GATEWAY_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// `ws://` endpoint. `None` keeps the client in degraded mode.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub subprotocol: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub client: ClientIdentity,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_handshake_watchdog_ms")]
    pub handshake_watchdog_ms: u64,
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
}

/// Identity metadata sent with the connect request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "missiondesk".to_string(),
            display_name: "Mission Desk".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            subprotocol: None,
            origin: None,
            headers: BTreeMap::new(),
            client: ClientIdentity::default(),
            role: default_role(),
            scopes: default_scopes(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_watchdog_ms: DEFAULT_HANDSHAKE_WATCHDOG_MS,
            backoff_floor_ms: DEFAULT_BACKOFF_FLOOR_MS,
            backoff_ceiling_ms: DEFAULT_BACKOFF_CEILING_MS,
        }
    }
}

impl GatewayConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Configured endpoint, ignoring blank values.
    pub fn endpoint(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn handshake_watchdog(&self) -> Duration {
        Duration::from_millis(self.handshake_watchdog_ms.max(1))
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms.max(1))
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms.max(self.backoff_floor_ms).max(1))
    }

    /// Override url/token from `MISSIONDESK_GATEWAY_URL` / `MISSIONDESK_GATEWAY_TOKEN`.
    pub fn apply_env(&mut self) {
        if let Some(url) = non_empty_env(ENV_URL) {
            self.url = Some(url);
        }
        if let Some(token) = non_empty_env(ENV_TOKEN) {
            self.token = Some(token);
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    gateway: Option<GatewayConfig>,
}

/// Read the `[gateway]` table of a TOML file. A missing file is not an error.
pub fn load_file_config(path: Option<&Path>) -> Result<Option<GatewayConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read gateway config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(parsed.gateway)
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["operator.read".to_string(), "operator.write".to_string()]
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_handshake_watchdog_ms() -> u64 {
    DEFAULT_HANDSHAKE_WATCHDOG_MS
}

fn default_backoff_floor_ms() -> u64 {
    DEFAULT_BACKOFF_FLOOR_MS
}

fn default_backoff_ceiling_ms() -> u64 {
    DEFAULT_BACKOFF_CEILING_MS
}
