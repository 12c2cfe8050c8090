use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_START_TIMEOUT_MS: u64 = 60_000;

/// Source tag for audit entries produced from gateway push events.
pub const GATEWAY_SOURCE: &str = "gateway";

/// Delegation status machine.
///
/// `pending → active → {in_progress, review, blocked} → {completed, error}`.
/// The middle tier is interchangeable, nothing moves backwards and terminal
/// statuses never change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Pending,
    Active,
    InProgress,
    Review,
    Blocked,
    Completed,
    Error,
}

impl DelegationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DelegationStatus::Completed | DelegationStatus::Error)
    }

    fn tier(self) -> u8 {
        match self {
            DelegationStatus::Pending => 0,
            DelegationStatus::Active => 1,
            DelegationStatus::InProgress
            | DelegationStatus::Review
            | DelegationStatus::Blocked => 2,
            DelegationStatus::Completed | DelegationStatus::Error => 3,
        }
    }

    /// Whether a status update from `self` to `next` should be recorded.
    pub fn can_advance_to(self, next: DelegationStatus) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        // Work states are only reachable once the run is active.
        if next.tier() == 2 && self.tier() < 1 {
            return false;
        }
        next.tier() >= self.tier()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Active => "active",
            DelegationStatus::InProgress => "in_progress",
            DelegationStatus::Review => "review",
            DelegationStatus::Blocked => "blocked",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Error => "error",
        }
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent working on one work item through the gateway.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub id: String,
    pub work_item_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub addressing_key_format: Option<String>,
    pub status: DelegationStatus,
    #[serde(default)]
    pub external_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delegation {
    /// Only delegations with a run id can be matched by push events.
    pub fn is_addressable(&self) -> bool {
        self.run_id.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct NewDelegation {
    pub work_item_id: String,
    pub agent_id: String,
}

/// Partial update applied by [`crate::DelegationStore::attach_session`].
///
/// `None` fields are left untouched. A status the state machine does not
/// allow is ignored rather than rejected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub session_key: Option<String>,
    pub addressing_key_format: Option<String>,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<DelegationStatus>,
    pub external_status: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: DelegationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStage {
    Backlog,
    InProgress,
    Review,
    Blocked,
    Done,
}

impl WorkStage {
    /// Stages an event may move a work item to automatically.
    pub fn allowed_targets(self) -> &'static [WorkStage] {
        match self {
            WorkStage::Backlog => &[WorkStage::InProgress],
            WorkStage::InProgress => &[WorkStage::Review, WorkStage::Blocked],
            WorkStage::Review => &[WorkStage::Blocked],
            WorkStage::Blocked => &[WorkStage::InProgress],
            WorkStage::Done => &[],
        }
    }

    pub fn can_transition_to(self, next: WorkStage) -> bool {
        self.allowed_targets().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStage::Backlog => "backlog",
            WorkStage::InProgress => "in_progress",
            WorkStage::Review => "review",
            WorkStage::Blocked => "blocked",
            WorkStage::Done => "done",
        }
    }
}

impl fmt::Display for WorkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKey {
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.progress")]
    AgentProgress,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
}

impl EventKey {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKey::AgentError => "agent.error",
            EventKey::AgentStarted => "agent.started",
            EventKey::AgentCompleted => "agent.completed",
            EventKey::AgentProgress => "agent.progress",
            EventKey::ApprovalRequested => "approval.requested",
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of a gateway push message.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct NormalizedEvent {
    pub event_key: EventKey,
    pub stage_update: Option<WorkStage>,
    pub actor_id: Option<String>,
    pub delegation_status: Option<DelegationStatus>,
    pub external_status: Option<String>,
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub work_item_id: String,
    pub event_type: String,
    pub event_key: EventKey,
    pub source: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// A key format label (`agent_task`, `task_agent`, `flat`) or a template
    /// with `{agent}` / `{task}` placeholders, tried before the fallbacks.
    #[serde(default)]
    pub preferred_key_format: Option<String>,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            preferred_key_format: None,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
        }
    }
}

impl OrchestrationConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

pub fn default_start_timeout_ms() -> u64 {
    DEFAULT_START_TIMEOUT_MS
}
