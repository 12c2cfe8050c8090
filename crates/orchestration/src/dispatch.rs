//! Inbound push events to delegation updates.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::Collaborators;
use crate::keys::work_item_from_session_key;
use crate::normalize::normalize;
use crate::stage::{StageGuard, StageOutcome};
use crate::types::{AuditEntry, Delegation, EventKey, SessionUpdate, GATEWAY_SOURCE};

const RUN_ID_PATHS: &[&str] = &["/runId", "/run_id", "/data/runId", "/run/id"];
const SESSION_KEY_PATHS: &[&str] = &[
    "/sessionKey",
    "/session_key",
    "/data/sessionKey",
    "/session/key",
];
const SESSION_ID_PATHS: &[&str] = &["/sessionId", "/session_id", "/session/id"];

/// Identifiers a push payload may carry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRefs {
    pub run_id: Option<String>,
    pub session_key: Option<String>,
    pub session_id: Option<String>,
}

impl EventRefs {
    pub fn extract(payload: &Value) -> Self {
        Self {
            run_id: first_str(payload, RUN_ID_PATHS),
            session_key: first_str(payload, SESSION_KEY_PATHS),
            session_id: first_str(payload, SESSION_ID_PATHS),
        }
    }
}

fn first_str(payload: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        payload
            .pointer(path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// No addressable delegation matched; nothing was written.
    Orphan,
    /// The message shape is not a known event; nothing was written.
    Unrecognized,
    Applied {
        delegation_id: String,
        event_key: EventKey,
        stage: StageOutcome,
    },
}

/// Routes push events to the delegation they belong to.
#[derive(Clone)]
pub struct Dispatcher {
    collaborators: Collaborators,
    guard: StageGuard,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        let guard = StageGuard::new(
            collaborators.work_items.clone(),
            collaborators.notifier.clone(),
        );
        Self {
            collaborators,
            guard,
        }
    }

    /// Run id, then session key, then the work item named in the session key.
    pub async fn lookup(&self, refs: &EventRefs) -> Result<Option<Delegation>> {
        let store = &self.collaborators.delegations;

        if let Some(run_id) = &refs.run_id {
            if let Some(found) = store.find_by_run_id(run_id).await? {
                return Ok(Some(found));
            }
        }

        let Some(session_key) = &refs.session_key else {
            return Ok(None);
        };
        if let Some(found) = store.find_by_session_key(session_key).await? {
            return Ok(Some(found));
        }

        match work_item_from_session_key(session_key) {
            Some(work_item_id) => store.find_latest_for_work_item(&work_item_id).await,
            None => Ok(None),
        }
    }

    pub async fn dispatch(&self, message_type: &str, payload: &Value) -> Result<DispatchOutcome> {
        let refs = EventRefs::extract(payload);

        let delegation = match self.lookup(&refs).await? {
            Some(delegation) if delegation.is_addressable() => delegation,
            Some(delegation) => {
                info!(
                    event = message_type,
                    delegation = %delegation.id,
                    "dropping event for delegation without run id"
                );
                return Ok(DispatchOutcome::Orphan);
            }
            None if refs == EventRefs::default() => {
                debug!(event = message_type, "gateway event without run or session reference");
                return Ok(DispatchOutcome::Orphan);
            }
            None => {
                info!(
                    event = message_type,
                    run_id = refs.run_id.as_deref().unwrap_or("-"),
                    session_key = refs.session_key.as_deref().unwrap_or("-"),
                    "dropping orphan gateway event"
                );
                return Ok(DispatchOutcome::Orphan);
            }
        };

        let Some(event) = normalize(message_type, payload) else {
            debug!(event = message_type, "unrecognised gateway event");
            return Ok(DispatchOutcome::Unrecognized);
        };

        // A closed delegation keeps the label it ended with.
        let external_status = if delegation.status.is_terminal() {
            None
        } else {
            event.external_status.clone()
        };
        let update = SessionUpdate {
            status: event.delegation_status,
            external_status,
            session_id: refs.session_id.filter(|id| delegation.session_id.as_ref() != Some(id)),
            ..SessionUpdate::default()
        };
        self.collaborators
            .delegations
            .attach_session(&delegation.id, update)
            .await?;

        let stage = self.guard.apply(&delegation.work_item_id, &event).await?;

        self.collaborators
            .events
            .append(AuditEntry {
                work_item_id: delegation.work_item_id.clone(),
                event_type: message_type.to_string(),
                event_key: event.event_key,
                source: GATEWAY_SOURCE.to_string(),
                actor_id: event.actor_id.clone().or_else(|| Some(delegation.agent_id.clone())),
                payload: event.payload,
                recorded_at: Utc::now(),
            })
            .await?;

        debug!(
            delegation = %delegation.id,
            key = %event.event_key,
            "gateway event applied"
        );
        Ok(DispatchOutcome::Applied {
            delegation_id: delegation.id,
            event_key: event.event_key,
            stage,
        })
    }
}
