use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::backend::{ChangeNotifier, WorkItemStore};
use crate::types::{NormalizedEvent, WorkStage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Applied { from: WorkStage, to: WorkStage },
    NotApplied,
}

/// Applies event stage suggestions that are legal from the current stage.
#[derive(Clone)]
pub struct StageGuard {
    work_items: Arc<dyn WorkItemStore>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl StageGuard {
    pub fn new(work_items: Arc<dyn WorkItemStore>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            work_items,
            notifier,
        }
    }

    pub async fn apply(&self, work_item_id: &str, event: &NormalizedEvent) -> Result<StageOutcome> {
        let Some(target) = event.stage_update else {
            return Ok(StageOutcome::NotApplied);
        };
        let Some(current) = self.work_items.get_stage(work_item_id).await? else {
            debug!(work_item = work_item_id, "stage update for unknown work item");
            return Ok(StageOutcome::NotApplied);
        };

        if !current.can_transition_to(target) {
            debug!(
                work_item = work_item_id,
                from = %current,
                to = %target,
                "stage transition not allowed"
            );
            return Ok(StageOutcome::NotApplied);
        }

        if !self.work_items.move_stage(work_item_id, target).await? {
            return Ok(StageOutcome::NotApplied);
        }

        if let Err(err) = self.notifier.on_work_item_changed(work_item_id).await {
            warn!(work_item = work_item_id, "change notification failed: {err:#}");
        }
        Ok(StageOutcome::Applied {
            from: current,
            to: target,
        })
    }
}
