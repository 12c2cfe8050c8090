use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::backend::{ChangeNotifier, DelegationStore, EventLog, WorkItemStore};
use crate::types::{
    AuditEntry, Delegation, DelegationStatus, NewDelegation, SessionUpdate, WorkStage,
};

#[derive(Default)]
struct LocalState {
    delegations: HashMap<String, Delegation>,
    /// Delegation ids in creation order, newest last.
    order: Vec<String>,
    work_items: HashMap<String, WorkStage>,
    audit: Vec<AuditEntry>,
    changed: Vec<String>,
}

impl LocalState {
    fn newest<'a>(&'a self, mut pred: impl FnMut(&Delegation) -> bool) -> Option<&'a Delegation> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.delegations.get(id))
            .find(|d| pred(*d))
    }
}

/// In-memory delegation store, work-item store, event log and notifier.
#[derive(Default)]
pub struct LocalBackend {
    state: Mutex<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("orchestration context poisoned"))
    }

    pub fn insert_work_item(&self, work_item_id: &str, stage: WorkStage) -> Result<()> {
        self.state()?
            .work_items
            .insert(work_item_id.to_string(), stage);
        Ok(())
    }

    pub fn stage_of(&self, work_item_id: &str) -> Result<Option<WorkStage>> {
        Ok(self.state()?.work_items.get(work_item_id).copied())
    }

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.state()?.audit.clone())
    }

    /// Work item ids passed to the change notifier, in call order.
    pub fn changed_work_items(&self) -> Result<Vec<String>> {
        Ok(self.state()?.changed.clone())
    }

    pub fn delegations(&self) -> Result<Vec<Delegation>> {
        let state = self.state()?;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.delegations.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl DelegationStore for LocalBackend {
    async fn create_delegation(&self, new: NewDelegation) -> Result<Delegation> {
        let mut state = self.state()?;
        let now = Utc::now();
        let delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            work_item_id: new.work_item_id,
            agent_id: new.agent_id,
            run_id: None,
            session_key: None,
            session_id: None,
            addressing_key_format: None,
            status: DelegationStatus::Pending,
            external_status: None,
            created_at: now,
            updated_at: now,
        };

        state.order.push(delegation.id.clone());
        state
            .delegations
            .insert(delegation.id.clone(), delegation.clone());
        Ok(delegation)
    }

    async fn attach_session(
        &self,
        delegation_id: &str,
        update: SessionUpdate,
    ) -> Result<Delegation> {
        let mut state = self.state()?;
        let current = state
            .delegations
            .get(delegation_id)
            .ok_or_else(|| anyhow!("unknown delegation: {delegation_id}"))?;

        if let (Some(existing), Some(next)) = (&current.run_id, &update.run_id) {
            if existing != next {
                bail!("delegation {delegation_id} already has run id {existing}");
            }
        }

        if let Some(key) = &update.session_key {
            let taken = state.delegations.values().any(|other| {
                other.id != delegation_id
                    && !other.status.is_terminal()
                    && other.session_key.as_deref() == Some(key.as_str())
            });
            if taken {
                bail!("session key {key} is held by another active delegation");
            }
        }

        let delegation = state
            .delegations
            .get_mut(delegation_id)
            .ok_or_else(|| anyhow!("unknown delegation: {delegation_id}"))?;

        if let Some(run_id) = update.run_id {
            delegation.run_id = Some(run_id);
        }
        if let Some(key) = update.session_key {
            delegation.session_key = Some(key);
        }
        if let Some(format) = update.addressing_key_format {
            delegation.addressing_key_format = Some(format);
        }
        if let Some(session_id) = update.session_id {
            delegation.session_id = Some(session_id);
        }
        if let Some(external) = update.external_status {
            delegation.external_status = Some(external);
        }
        if let Some(status) = update.status {
            if delegation.status.can_advance_to(status) {
                delegation.status = status;
            }
        }
        delegation.updated_at = Utc::now();

        Ok(delegation.clone())
    }

    async fn find_by_run_id(&self, run_id: &str) -> Result<Option<Delegation>> {
        let state = self.state()?;
        Ok(state
            .newest(|d| d.run_id.as_deref() == Some(run_id))
            .cloned())
    }

    async fn find_by_session_key(&self, session_key: &str) -> Result<Option<Delegation>> {
        let state = self.state()?;
        let matches = |d: &Delegation| d.session_key.as_deref() == Some(session_key);
        Ok(state
            .newest(|d| matches(d) && !d.status.is_terminal())
            .or_else(|| state.newest(matches))
            .cloned())
    }

    async fn find_latest_for_work_item(&self, work_item_id: &str) -> Result<Option<Delegation>> {
        let state = self.state()?;
        Ok(state.newest(|d| d.work_item_id == work_item_id).cloned())
    }

    async fn get_delegation(&self, delegation_id: &str) -> Result<Option<Delegation>> {
        Ok(self.state()?.delegations.get(delegation_id).cloned())
    }
}

#[async_trait]
impl WorkItemStore for LocalBackend {
    async fn get_stage(&self, work_item_id: &str) -> Result<Option<WorkStage>> {
        self.stage_of(work_item_id)
    }

    async fn move_stage(&self, work_item_id: &str, stage: WorkStage) -> Result<bool> {
        let mut state = self.state()?;
        match state.work_items.get_mut(work_item_id) {
            Some(current) if *current != stage => {
                *current = stage;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EventLog for LocalBackend {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.state()?.audit.push(entry);
        Ok(())
    }
}

#[async_trait]
impl ChangeNotifier for LocalBackend {
    async fn on_work_item_changed(&self, work_item_id: &str) -> Result<()> {
        self.state()?.changed.push(work_item_id.to_string());
        Ok(())
    }
}
