use crate::execution::ExecutionMode;
use crate::planning::{CheckpointType, ExecutionPlan, ExecutionResult, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Position of a plan run, persisted whenever the run stops or advances.
///
/// `completed_task_ids` and `skipped_task_ids` hold 0-based task positions;
/// both are always below `current_task_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub plan_path: String,
    pub run_id: String,
    pub mode: ExecutionMode,
    pub current_task_index: usize,
    #[serde(default)]
    pub completed_task_ids: BTreeSet<usize>,
    #[serde(default)]
    pub skipped_task_ids: BTreeSet<usize>,
    /// 1-based task id -> chosen option id.
    #[serde(default)]
    pub decisions_made: BTreeMap<usize, String>,
    #[serde(default)]
    pub paused_at_checkpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_type: Option<CheckpointType>,
    #[serde(default)]
    pub results: Vec<ExecutionResult>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(plan_path: impl Into<String>, mode: ExecutionMode, now: DateTime<Utc>) -> Self {
        Self {
            plan_path: plan_path.into(),
            run_id: uuid::Uuid::now_v7().to_string(),
            mode,
            current_task_index: 0,
            completed_task_ids: BTreeSet::new(),
            skipped_task_ids: BTreeSet::new(),
            decisions_made: BTreeMap::new(),
            paused_at_checkpoint: false,
            checkpoint_type: None,
            results: Vec::new(),
            saved_at: now,
        }
    }

    pub fn invariant_holds(&self) -> bool {
        self.completed_task_ids
            .iter()
            .chain(self.skipped_task_ids.iter())
            .all(|&i| i < self.current_task_index)
    }

    pub fn pause(&mut self, kind: CheckpointType) {
        self.paused_at_checkpoint = true;
        self.checkpoint_type = Some(kind);
    }

    pub fn clear_pause(&mut self) {
        self.paused_at_checkpoint = false;
        self.checkpoint_type = None;
    }

    /// Settles the task at `current_task_index` and moves past it.
    pub fn settle_current(&mut self, status: TaskStatus, result: Option<ExecutionResult>) {
        let index = self.current_task_index;
        match status {
            TaskStatus::Completed => {
                self.completed_task_ids.insert(index);
            }
            TaskStatus::Skipped => {
                self.skipped_task_ids.insert(index);
            }
            _ => {}
        }
        if let Some(result) = result {
            self.results.push(result);
        }
        self.current_task_index += 1;
        self.clear_pause();
    }

    /// Status of an already-passed task as recorded in this state.
    pub fn settled_status(&self, index: usize) -> TaskStatus {
        if index >= self.current_task_index {
            TaskStatus::Pending
        } else if self.completed_task_ids.contains(&index) {
            TaskStatus::Completed
        } else if self.skipped_task_ids.contains(&index) {
            TaskStatus::Skipped
        } else {
            TaskStatus::Failed
        }
    }

    /// Checks the persisted position still fits `plan`. Returns a reason
    /// on mismatch.
    pub fn validate_against(&self, plan: &ExecutionPlan) -> Result<(), String> {
        if self.current_task_index > plan.len() {
            return Err(format!(
                "state points at task {} but the plan has {} tasks",
                self.current_task_index + 1,
                plan.len()
            ));
        }
        if let Some(bad) = self
            .completed_task_ids
            .iter()
            .chain(self.skipped_task_ids.iter())
            .find(|&&i| i >= plan.len())
        {
            return Err(format!("recorded task {} no longer exists", bad + 1));
        }
        if let Some(&task_id) = self.decisions_made.keys().find(|&&id| id == 0 || id > plan.len()) {
            return Err(format!("decision recorded for missing task {task_id}"));
        }
        if self.paused_at_checkpoint
            && let Some(kind) = self.checkpoint_type
            && kind != CheckpointType::ManualConfirm
        {
            let actual = plan
                .task(self.current_task_index)
                .and_then(|t| t.checkpoint_type());
            if actual != Some(kind) {
                return Err(format!(
                    "paused at a {kind} checkpoint but task {} is no longer one",
                    self.current_task_index + 1
                ));
            }
        }
        Ok(())
    }
}

/// Continuation left behind when a run is cancelled mid-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledExecutionInfo {
    pub plan_path: String,
    pub paused_task_index: usize,
    #[serde(default)]
    pub results_so_far: Vec<ExecutionResult>,
    pub cancelled_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CancelledExecutionInfo {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Liveness heartbeat for a run that is currently streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveExecutionMarker {
    pub plan_path: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Text stashed for the next task prompt; consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExecutionContext {
    pub plan_path: String,
    pub text: String,
    pub stashed_at: DateTime<Utc>,
}

/// Ask a live run (possibly in another process) to stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub plan_path: String,
    pub requested_at: DateTime<Utc>,
}
