use crate::execution::failure::cap;
use crate::planning::{CheckpointType, ExecutionResult, TaskStatus};
use serde::Serialize;

/// How a single invocation of the executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Paused { kind: CheckpointType, index: usize },
    Cancelled { index: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_path: String,
    pub outcome: RunOutcome,
    pub results: Vec<ExecutionResult>,
    /// `(task id, status)` in plan order.
    pub statuses: Vec<(usize, TaskStatus)>,
}

impl RunReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.statuses.iter().filter(|(_, s)| *s == status).count()
    }

    pub fn status_of(&self, task_id: usize) -> Option<TaskStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, s)| *s)
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        let head = match self.outcome {
            RunOutcome::Completed => "Plan finished".to_string(),
            RunOutcome::Paused { kind, index } => {
                format!("Paused at task {} ({kind})", index + 1)
            }
            RunOutcome::Cancelled { index } => format!("Cancelled during task {}", index + 1),
        };
        s.push_str(&format!(
            "{head}: {} completed, {} failed, {} skipped, {} pending\n",
            self.count(TaskStatus::Completed),
            self.count(TaskStatus::Failed),
            self.count(TaskStatus::Skipped),
            self.count(TaskStatus::Pending) + self.count(TaskStatus::Running)
        ));
        for r in self.results.iter().filter(|r| !r.success) {
            let reason = r.error.as_deref().unwrap_or("failed");
            s.push_str(&format!("  task {}: {}\n", r.task_id, cap(reason, 300)));
        }
        s
    }
}
