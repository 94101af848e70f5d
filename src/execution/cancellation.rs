//! Stop means pause. A cancelled run leaves a short-lived continuation
//! behind and the next piece of user text resumes it as context.

use crate::execution::error::ExecutionError;
use crate::execution::notify::{Notice, NoticeKind, Notifier};
use crate::state::{CancelledExecutionInfo, ExecutionState, StateStore};
use tracing::{debug, info};

/// Where a piece of user input ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRoute {
    /// Slash-prefixed text; never treated as context.
    Command(String),
    /// Stashed as resume context for the cancelled run paused at `index`.
    ResumeCancelled { index: usize },
    /// Stashed for the running task to pick up at its next loop turn.
    InjectedIntoActive,
    /// No cancelled or live run for this plan.
    Idle,
}

pub struct CancellationManager<'a> {
    store: &'a StateStore,
}

impl<'a> CancellationManager<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    /// Persists the run as cancelled at its current task and tells the user
    /// on the side channel.
    pub fn on_cancelled(
        &self,
        state: &mut ExecutionState,
        notifier: &dyn Notifier,
    ) -> Result<CancelledExecutionInfo, ExecutionError> {
        self.store.save_execution_state(state)?;
        let info = self.store.save_cancelled(
            &state.plan_path,
            state.current_task_index,
            state.results.clone(),
        )?;
        let window = humantime::format_duration(
            self.store
                .resume_window()
                .to_std()
                .unwrap_or_default(),
        );
        notifier.notify(&Notice::new(
            NoticeKind::Cancelled,
            format!("Paused at task {}", info.paused_task_index + 1),
            format!(
                "Send more context within {window} to resume this task \
                 (planwright input {} <text>), or run `planwright resume {}`.",
                info.plan_path, info.plan_path
            ),
        ));
        Ok(info)
    }

    /// Routes free text for `plan_path` and stashes it where it applies.
    pub fn route_input(&self, plan_path: &str, text: &str) -> Result<InputRoute, ExecutionError> {
        let trimmed = text.trim();
        if trimmed.starts_with('/') {
            debug!(plan = %plan_path, "input is a command, not context");
            return Ok(InputRoute::Command(trimmed.to_string()));
        }
        if trimmed.is_empty() {
            return Ok(InputRoute::Idle);
        }

        if let Some(info) = self.store.load_cancelled(plan_path)? {
            self.store.stash_pending_context(plan_path, trimmed)?;
            info!(plan = %plan_path, index = info.paused_task_index, "input stashed as resume context");
            return Ok(InputRoute::ResumeCancelled {
                index: info.paused_task_index,
            });
        }

        if self.store.load_active(plan_path)?.is_some() {
            self.store.stash_pending_context(plan_path, trimmed)?;
            info!(plan = %plan_path, "input stashed for the running task");
            return Ok(InputRoute::InjectedIntoActive);
        }

        Ok(InputRoute::Idle)
    }
}
