use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::local::LocalBackend;
use crate::types::{AuditEntry, Delegation, NewDelegation, SessionUpdate, WorkStage};

/// Persistence for delegation records.
#[async_trait]
pub trait DelegationStore: Send + Sync {
    async fn create_delegation(&self, new: NewDelegation) -> Result<Delegation>;

    /// Apply `update` to a delegation. Fails if it would change an assigned
    /// run id or reuse a session key held by another active delegation.
    async fn attach_session(&self, delegation_id: &str, update: SessionUpdate)
        -> Result<Delegation>;

    async fn find_by_run_id(&self, run_id: &str) -> Result<Option<Delegation>>;

    async fn find_by_session_key(&self, session_key: &str) -> Result<Option<Delegation>>;

    async fn find_latest_for_work_item(&self, work_item_id: &str) -> Result<Option<Delegation>>;

    async fn get_delegation(&self, delegation_id: &str) -> Result<Option<Delegation>>;
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn get_stage(&self, work_item_id: &str) -> Result<Option<WorkStage>>;

    /// Returns `true` when the stage was actually changed.
    async fn move_stage(&self, work_item_id: &str, stage: WorkStage) -> Result<bool>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;
}

#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn on_work_item_changed(&self, work_item_id: &str) -> Result<()>;
}

/// The external collaborators the delegation pipeline writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub delegations: Arc<dyn DelegationStore>,
    pub work_items: Arc<dyn WorkItemStore>,
    pub events: Arc<dyn EventLog>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl Collaborators {
    /// All four roles served by one in-memory backend.
    pub fn local(backend: Arc<LocalBackend>) -> Self {
        Self {
            delegations: backend.clone(),
            work_items: backend.clone(),
            events: backend.clone(),
            notifier: backend,
        }
    }
}
