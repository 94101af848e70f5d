use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single task within one plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether `self -> next` is a legal forward move.
    ///
    /// `pending -> running -> {completed|failed|skipped}`; a pending task may
    /// also be skipped or resolved directly (checkpoints never "run").
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Pending) => false,
            (TaskStatus::Pending, _) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id}: illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub task_id: usize,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTask {
    pub id: usize,
    pub name: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub action: String,
    pub verify: String,
    pub done: String,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointVerifyTask {
    pub id: usize,
    pub name: String,
    pub what_built: String,
    pub verification_steps: Vec<String>,
    pub resume_signal: String,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub name: String,
    pub pros: String,
    pub cons: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDecisionTask {
    pub id: usize,
    pub name: String,
    pub decision: String,
    pub context: String,
    pub options: Vec<DecisionOption>,
    pub resume_signal: String,
    #[serde(default)]
    pub status: TaskStatus,
}

impl CheckpointDecisionTask {
    /// Option chosen when nobody is around to choose.
    pub fn default_option(&self) -> Option<&DecisionOption> {
        self.options.first()
    }

    pub fn option(&self, id: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == id)
    }
}

/// One unit of plan work, tagged by the `type` attribute of its `<task>` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Auto(AutoTask),
    CheckpointVerify(CheckpointVerifyTask),
    CheckpointDecision(CheckpointDecisionTask),
}

/// Which kind of human gate a run is paused at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointType {
    HumanVerify,
    Decision,
    /// Manual mode confirmation in front of an auto task.
    ManualConfirm,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::HumanVerify => "human-verify",
            CheckpointType::Decision => "decision",
            CheckpointType::ManualConfirm => "manual-confirm",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    pub fn id(&self) -> usize {
        match self {
            Task::Auto(t) => t.id,
            Task::CheckpointVerify(t) => t.id,
            Task::CheckpointDecision(t) => t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Auto(t) => &t.name,
            Task::CheckpointVerify(t) => &t.name,
            Task::CheckpointDecision(t) => &t.name,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Task::Auto(t) => t.status,
            Task::CheckpointVerify(t) => t.status,
            Task::CheckpointDecision(t) => t.status,
        }
    }

    fn status_mut(&mut self) -> &mut TaskStatus {
        match self {
            Task::Auto(t) => &mut t.status,
            Task::CheckpointVerify(t) => &mut t.status,
            Task::CheckpointDecision(t) => &mut t.status,
        }
    }

    /// Move the task forward; regressions are rejected.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        let id = self.id();
        let current = self.status_mut();
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                task_id: id,
                from: *current,
                to: next,
            });
        }
        *current = next;
        Ok(())
    }

    /// The `type` attribute used in plan documents.
    pub fn type_attr(&self) -> &'static str {
        match self {
            Task::Auto(_) => "auto",
            Task::CheckpointVerify(_) => "checkpoint:human-verify",
            Task::CheckpointDecision(_) => "checkpoint:decision",
        }
    }

    pub fn checkpoint_type(&self) -> Option<CheckpointType> {
        match self {
            Task::Auto(_) => None,
            Task::CheckpointVerify(_) => Some(CheckpointType::HumanVerify),
            Task::CheckpointDecision(_) => Some(CheckpointType::Decision),
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        self.checkpoint_type().is_some()
    }
}

/// A parsed plan document. Only task statuses change after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phase_id: String,
    /// Kept verbatim, including any non-numeric suffix such as `02a`.
    pub plan_identifier: String,
    pub objective: String,
    pub purpose: String,
    pub tasks: Vec<Task>,
    pub verification: Vec<String>,
    pub success_criteria: Vec<String>,
}

impl ExecutionPlan {
    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Outcome of one task, accumulated for the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok(task_id: usize, output: impl Into<String>) -> Self {
        Self {
            task_id,
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(task_id: usize, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}
