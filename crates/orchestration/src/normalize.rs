//! Push message normalization.
//!
//! Gateway push events come in several historical shapes (`agent` streams,
//! `chat` states, session and approval notices). [`normalize`] folds them into
//! one [`NormalizedEvent`]. It is a pure function: no clock, no I/O.

use serde_json::Value;

use crate::types::{DelegationStatus, EventKey, NormalizedEvent, WorkStage};

const LIFECYCLE: &str = "lifecycle";

/// Map one push message to its canonical event. Unknown shapes yield `None`.
///
/// Rules are checked in order and the first match wins: error, lifecycle
/// start, lifecycle end, progress, session completed, approval.
pub fn normalize(message_type: &str, raw: &Value) -> Option<NormalizedEvent> {
    let stream = str_field(raw, &["stream"]);
    let state = str_field(raw, &["state"]);
    let phase = raw
        .pointer("/data/phase")
        .and_then(Value::as_str)
        .or_else(|| str_field(raw, &["phase"]));
    let is_agent = message_type == "agent";
    let is_chat = message_type == "chat";
    let is_lifecycle = is_agent && stream == Some(LIFECYCLE);

    let (key, external) = if let Some(label) = error_label(message_type, raw, stream, state, phase)
    {
        (EventKey::AgentError, label)
    } else if is_lifecycle && phase == Some("start") {
        (EventKey::AgentStarted, "lifecycle:start".to_string())
    } else if is_lifecycle && phase == Some("end") {
        (EventKey::AgentCompleted, "lifecycle:end".to_string())
    } else if is_agent {
        let label = match (stream, phase) {
            (Some(LIFECYCLE), Some(phase)) => format!("lifecycle:{phase}"),
            (Some(stream), _) => format!("agent:{stream}"),
            (None, _) => "agent:progress".to_string(),
        };
        (EventKey::AgentProgress, label)
    } else if is_chat && state == Some("delta") {
        (EventKey::AgentProgress, "chat:delta".to_string())
    } else if message_type == "agent.progress" {
        (EventKey::AgentProgress, "progress".to_string())
    } else if message_type == "session.completed" {
        (EventKey::AgentCompleted, "session:completed".to_string())
    } else if is_chat && state == Some("final") {
        (EventKey::AgentCompleted, "chat:final".to_string())
    } else if matches!(message_type, "exec.approval.requested" | "approval.requested") {
        (EventKey::ApprovalRequested, "approval:requested".to_string())
    } else {
        return None;
    };

    let (stage_update, delegation_status) = effects(key);
    Some(NormalizedEvent {
        event_key: key,
        stage_update,
        actor_id: str_field(raw, &["agentId", "agent_id"]).map(String::from),
        delegation_status: Some(delegation_status),
        external_status: Some(external),
        payload: raw.clone(),
    })
}

fn error_label(
    message_type: &str,
    raw: &Value,
    stream: Option<&str>,
    state: Option<&str>,
    phase: Option<&str>,
) -> Option<String> {
    if stream == Some("error") {
        return Some("stream:error".to_string());
    }
    if message_type == "session.error" {
        return Some("session:error".to_string());
    }
    if raw.get("ok").and_then(Value::as_bool) == Some(false) {
        return Some(format!("{message_type}:failed"));
    }
    if message_type == "chat" && state == Some("error") {
        return Some("chat:error".to_string());
    }
    if stream == Some(LIFECYCLE) && phase == Some("error") {
        return Some("lifecycle:error".to_string());
    }
    None
}

fn effects(key: EventKey) -> (Option<WorkStage>, DelegationStatus) {
    match key {
        EventKey::AgentError => (Some(WorkStage::Blocked), DelegationStatus::Error),
        EventKey::AgentStarted => (Some(WorkStage::InProgress), DelegationStatus::InProgress),
        EventKey::AgentCompleted => (Some(WorkStage::Review), DelegationStatus::Completed),
        EventKey::AgentProgress => (None, DelegationStatus::InProgress),
        EventKey::ApprovalRequested => (Some(WorkStage::Review), DelegationStatus::Review),
    }
}

fn str_field<'a>(raw: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| raw.get(*name).and_then(Value::as_str))
}
