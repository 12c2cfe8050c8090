use std::sync::Arc;

use missiondesk_gateway::{GatewayClient, GatewayError, GatewayStatus, PushEvent};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::Collaborators;
use crate::dispatch::Dispatcher;
use crate::keys::{is_key_mismatch, negotiate, KeyCandidates};
use crate::types::{
    Delegation, DelegationStatus, NewDelegation, OrchestrationConfig, SessionUpdate,
};

pub const AGENT_METHOD: &str = "agent";
pub const CHAT_SEND_METHOD: &str = "chat.send";
pub const CHAT_ABORT_METHOD: &str = "chat.abort";

/// Lower-cased fragments of a request rejected for its shape rather than its content.
///
/// Heuristic, paired with an `INVALID_REQUEST` / `INVALID_PARAMS` code.
pub const SCHEMA_INCOMPATIBLE_PATTERNS: &[&str] = &[
    "unexpected property",
    "additional properties",
    "unknown field",
    "must not have additional",
    "invalid params",
    "schema",
];

const SCHEMA_ERROR_CODES: &[&str] = &["INVALID_REQUEST", "INVALID_PARAMS"];

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The gateway cannot serve this operation at all.
    #[error("gateway does not support {0}")]
    Unsupported(String),

    #[error("unknown delegation: {0}")]
    NotFound(String),

    #[error("delegation {0} has no session key")]
    MissingSessionKey(String),

    /// Another live delegation already owns the session this start would address.
    #[error("session key {session_key} is held by active delegation {delegation_id}")]
    SessionBusy {
        session_key: String,
        delegation_id: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub fn is_key_mismatch_error(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Remote { message, .. } if is_key_mismatch(message))
}

pub fn is_schema_incompatible(err: &GatewayError) -> bool {
    let GatewayError::Remote {
        code: Some(code),
        message,
    } = err
    else {
        return false;
    };
    if !SCHEMA_ERROR_CODES.contains(&code.as_str()) {
        return false;
    }
    let message = message.to_lowercase();
    SCHEMA_INCOMPATIBLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Starts, resumes and cancels delegations through the gateway and feeds
/// gateway push events into the delegation pipeline.
pub struct GatewayBackend {
    client: Arc<GatewayClient>,
    config: OrchestrationConfig,
    collaborators: Collaborators,
    dispatcher: Dispatcher,
}

impl GatewayBackend {
    pub fn new(
        client: Arc<GatewayClient>,
        config: OrchestrationConfig,
        collaborators: Collaborators,
    ) -> Self {
        let dispatcher = Dispatcher::new(collaborators.clone());
        Self {
            client,
            config,
            collaborators,
            dispatcher,
        }
    }

    pub fn client(&self) -> &Arc<GatewayClient> {
        &self.client
    }

    pub fn gateway_status(&self) -> GatewayStatus {
        self.client.status()
    }

    /// Take the client's push events and process them on a separate task.
    /// Returns `None` if another consumer already holds the event stream.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let events = self.client.take_events()?;
        Some(tokio::spawn(run_dispatcher(self.dispatcher.clone(), events)))
    }

    /// Create a delegation and start the agent run, negotiating the session key format.
    ///
    /// Fails with [`DelegationError::SessionBusy`] before any gateway call when an
    /// active delegation already holds one of the candidate session keys.
    pub async fn start_work(
        &self,
        work_item_id: &str,
        agent_id: &str,
        message: &str,
    ) -> Result<Delegation, DelegationError> {
        let store = &self.collaborators.delegations;
        let candidates = self.candidates(agent_id, work_item_id);
        for candidate in candidates.iter() {
            if let Some(holder) = store.find_by_session_key(&candidate.key).await? {
                if !holder.status.is_terminal() {
                    info!(
                        delegation = %holder.id,
                        session_key = %candidate.key,
                        "refusing start, session already delegated"
                    );
                    return Err(DelegationError::SessionBusy {
                        session_key: candidate.key.clone(),
                        delegation_id: holder.id,
                    });
                }
            }
        }

        let delegation = store
            .create_delegation(NewDelegation {
                work_item_id: work_item_id.to_string(),
                agent_id: agent_id.to_string(),
            })
            .await?;

        match self.start_run(&delegation, &candidates, message).await {
            Ok(started) => Ok(started),
            Err(err) => {
                warn!(
                    delegation = %delegation.id,
                    work_item = work_item_id,
                    "failed to start agent run: {}",
                    err
                );
                let failed = SessionUpdate {
                    status: Some(DelegationStatus::Error),
                    external_status: Some("start_failed".to_string()),
                    ..SessionUpdate::default()
                };
                if let Err(mark_err) = store.attach_session(&delegation.id, failed).await {
                    warn!(
                        delegation = %delegation.id,
                        "could not mark delegation failed: {mark_err:#}"
                    );
                }
                Err(err)
            }
        }
    }

    fn candidates(&self, agent_id: &str, work_item_id: &str) -> KeyCandidates {
        KeyCandidates::new(
            self.config.preferred_key_format.as_deref(),
            agent_id,
            work_item_id,
        )
    }

    async fn start_run(
        &self,
        delegation: &Delegation,
        candidates: &KeyCandidates,
        message: &str,
    ) -> Result<Delegation, DelegationError> {
        let timeout = self.config.start_timeout();

        let (candidate, reply) = negotiate(
            candidates,
            |candidate| {
                let params = json!({
                    "agentId": delegation.agent_id,
                    "sessionKey": candidate.key,
                    "message": message,
                    "idempotencyKey": Uuid::new_v4().to_string(),
                });
                let client = Arc::clone(&self.client);
                async move {
                    client
                        .call_with_timeout(AGENT_METHOD, params, timeout)
                        .await
                }
            },
            is_key_mismatch_error,
        )
        .await?;

        let run_id = str_field(&reply, &["runId", "run_id"]).ok_or_else(|| {
            GatewayError::Protocol(format!("{AGENT_METHOD} reply without runId: {reply}"))
        })?;

        let update = SessionUpdate {
            session_key: Some(candidate.key.clone()),
            addressing_key_format: Some(candidate.format.to_string()),
            run_id: Some(run_id.clone()),
            session_id: str_field(&reply, &["sessionId", "session_id"]),
            status: Some(DelegationStatus::Active),
            external_status: str_field(&reply, &["status"]),
        };
        let started = self
            .collaborators
            .delegations
            .attach_session(&delegation.id, update)
            .await?;

        info!(
            delegation = %started.id,
            run_id = %run_id,
            format = candidate.format,
            "agent run started"
        );
        Ok(started)
    }

    /// Send a follow-up message to the delegation's session. Returns the new
    /// run id when the gateway reports one.
    pub async fn resume(
        &self,
        delegation_id: &str,
        message: &str,
    ) -> Result<Option<String>, DelegationError> {
        let delegation = self.load(delegation_id).await?;
        let session_key = delegation
            .session_key
            .clone()
            .ok_or_else(|| DelegationError::MissingSessionKey(delegation.id.clone()))?;

        if !self.client.supports(CHAT_SEND_METHOD) {
            return Err(DelegationError::Unsupported(CHAT_SEND_METHOD.to_string()));
        }

        let params = json!({
            "sessionKey": session_key,
            "message": message,
            "idempotencyKey": Uuid::new_v4().to_string(),
        });
        let reply = match self.client.call(CHAT_SEND_METHOD, params).await {
            Ok(reply) => reply,
            Err(err) if is_schema_incompatible(&err) => {
                debug!(delegation = delegation_id, "chat.send rejected by schema: {}", err);
                return Err(DelegationError::Unsupported(CHAT_SEND_METHOD.to_string()));
            }
            Err(GatewayError::UnsupportedMethod(method)) => {
                return Err(DelegationError::Unsupported(method));
            }
            Err(err) => return Err(err.into()),
        };

        let run_id = str_field(&reply, &["runId", "run_id"]);
        if let (Some(run_id), None) = (&run_id, &delegation.run_id) {
            let update = SessionUpdate {
                run_id: Some(run_id.clone()),
                ..SessionUpdate::default()
            };
            self.collaborators
                .delegations
                .attach_session(&delegation.id, update)
                .await?;
        }
        Ok(run_id)
    }

    /// Abort the remote run when the gateway allows it and close out the delegation.
    pub async fn cancel(&self, delegation_id: &str) -> Result<Delegation, DelegationError> {
        let delegation = self.load(delegation_id).await?;

        match &delegation.session_key {
            Some(session_key) if self.client.supports(CHAT_ABORT_METHOD) => {
                let params = json!({"sessionKey": session_key, "runId": delegation.run_id});
                if let Err(err) = self.client.call(CHAT_ABORT_METHOD, params).await {
                    warn!(delegation = delegation_id, "chat.abort failed: {}", err);
                }
            }
            _ => debug!(delegation = delegation_id, "no remote abort available"),
        }

        let update = SessionUpdate {
            status: Some(DelegationStatus::Error),
            external_status: Some("aborted".to_string()),
            ..SessionUpdate::default()
        };
        Ok(self
            .collaborators
            .delegations
            .attach_session(&delegation.id, update)
            .await?)
    }

    async fn load(&self, delegation_id: &str) -> Result<Delegation, DelegationError> {
        self.collaborators
            .delegations
            .get_delegation(delegation_id)
            .await?
            .ok_or_else(|| DelegationError::NotFound(delegation_id.to_string()))
    }
}

/// Process push events one at a time until the client drops its sender.
pub async fn run_dispatcher(
    dispatcher: Dispatcher,
    mut events: mpsc::UnboundedReceiver<PushEvent>,
) {
    while let Some(event) = events.recv().await {
        if let Err(err) = dispatcher.dispatch(&event.event, &event.payload).await {
            warn!(event = %event.event, "failed to apply gateway event: {err:#}");
        }
    }
    debug!("gateway event stream closed");
}

fn str_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_str))
        .map(String::from)
}
