//! Plan execution as a resumable saga.
//!
//! Nothing about a run lives only in memory between invocations: every
//! pause, cancellation and task settlement is written to the state store
//! before control returns, and `resume`/`resume_from_cancel` rebuild the run
//! from those records alone.

use crate::config::ExecutionConfig;
use crate::execution::cancellation::CancellationManager;
use crate::execution::checkpoint::{CheckpointGate, ExecutionMode, GateDecision, HumanInput, Resolution};
use crate::execution::error::ExecutionError;
use crate::execution::failure::{Classification, cap, classify};
use crate::execution::issues::{IssueLogger, Severity};
use crate::execution::notify::{GatedOutput, Notice, NoticeKind, Notifier, OutputSink};
use crate::execution::orchestrator::{LoopStop, Orchestrator};
use crate::execution::report::{RunOutcome, RunReport};
use crate::execution::retry::RetryPolicy;
use crate::llm::ChatAgent;
use crate::planning::{
    AutoTask, CheckpointType, ExecutionPlan, ExecutionResult, Task, TaskStatus, parse_plan_file,
};
use crate::state::{ExecutionState, StateStore};
use crate::tools::ToolRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Store key for a plan: its canonical path, so relative and absolute
/// spellings of the same file share records.
pub fn plan_key(plan_path: &Path) -> Result<String, ExecutionError> {
    std::fs::canonicalize(plan_path)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|source| ExecutionError::PlanRead {
            path: plan_path.display().to_string(),
            source,
        })
}

enum TaskOutcome {
    Completed(String),
    Failed(ExecutionError),
    Cancelled,
}

pub struct PlanExecutor {
    agent: Arc<dyn ChatAgent>,
    tools: ToolRegistry,
    store: Arc<StateStore>,
    sink: Arc<dyn OutputSink>,
    notifier: Arc<dyn Notifier>,
    config: ExecutionConfig,
}

impl PlanExecutor {
    pub fn new(
        agent: Arc<dyn ChatAgent>,
        tools: &ToolRegistry,
        store: Arc<StateStore>,
        sink: Arc<dyn OutputSink>,
        notifier: Arc<dyn Notifier>,
        config: ExecutionConfig,
    ) -> Self {
        let tools = tools.filtered(&config.tool_tag);
        if tools.is_empty() {
            warn!(tag = %config.tool_tag, "no tools carry the configured tag");
        }
        Self {
            agent,
            tools,
            store,
            sink,
            notifier,
            config,
        }
    }

    /// Starts `plan_path` from its first task, discarding stale records.
    pub async fn run(
        &self,
        plan_path: &Path,
        mode: ExecutionMode,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        let key = plan_key(plan_path)?;
        let plan = parse_plan_file(plan_path)?;
        info!(plan = %key, %mode, tasks = plan.len(), "starting run");

        self.store.clear_all(&key)?;
        self.store.mark_active(&key)?;
        let mut state = ExecutionState::new(&key, mode, self.store.now());
        self.store.save_execution_state(&mut state)?;

        self.drive(plan_path, plan, state, false, cancel).await
    }

    /// Continues a run paused at a checkpoint or a manual confirmation, or
    /// one stopped by an unavailable model. A cancelled run inside its
    /// resume window is picked up as well.
    pub async fn resume(
        &self,
        plan_path: &Path,
        input: &HumanInput,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        let key = plan_key(plan_path)?;
        if self.store.load_cancelled(&key)?.is_some() {
            if input.decision.is_some() || input.reject.is_some() || input.skip {
                warn!(plan = %key, "ignoring checkpoint flags, resuming a cancelled run");
            }
            return self.resume_from_cancel(plan_path, None, cancel).await;
        }

        let mut state = self
            .store
            .load_execution_state(&key)?
            .ok_or_else(|| ExecutionError::NoResumableState(key.clone()))?;
        let mut plan = parse_plan_file(plan_path)?;
        state
            .validate_against(&plan)
            .map_err(|reason| ExecutionError::PlanMismatch {
                path: key.clone(),
                reason,
            })?;

        let mut confirmed = false;
        if state.paused_at_checkpoint {
            let kind = state.checkpoint_type.ok_or_else(|| ExecutionError::PlanMismatch {
                path: key.clone(),
                reason: "paused without a checkpoint type".into(),
            })?;
            let index = state.current_task_index;
            let task = plan.task(index).ok_or_else(|| ExecutionError::PlanMismatch {
                path: key.clone(),
                reason: format!("no task at index {index}"),
            })?;
            let resolution = CheckpointGate::new(state.mode)
                .resolve_human(task, kind, input)
                .map_err(|e| match e {
                    ExecutionError::PlanMismatch { reason, .. } => ExecutionError::PlanMismatch {
                        path: key.clone(),
                        reason,
                    },
                    other => other,
                })?;
            info!(plan = %key, task = index + 1, ?resolution, "checkpoint resolved");

            replay_statuses(&mut plan, &state)?;
            if resolution == Resolution::Confirmed {
                state.clear_pause();
                confirmed = true;
            } else {
                self.apply_resolution(&mut plan, &mut state, resolution)?;
            }
        } else if input.decision.is_some() || input.reject.is_some() || input.skip {
            return Err(ExecutionError::InvalidDecision(
                "the run is not paused at a checkpoint".into(),
            ));
        } else {
            replay_statuses(&mut plan, &state)?;
        }

        self.store.mark_active(&key)?;
        self.store.save_execution_state(&mut state)?;
        self.notifier.notify(&Notice::new(
            NoticeKind::Resumed,
            format!("Resuming at task {}", state.current_task_index + 1),
            key.clone(),
        ));
        self.drive_replayed(plan_path, plan, state, confirmed, cancel).await
    }

    /// Re-enters a cancelled run at the task it was stopped in, with
    /// `context` (and anything stashed since) merged into that task's prompt.
    pub async fn resume_from_cancel(
        &self,
        plan_path: &Path,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        let key = plan_key(plan_path)?;
        let Some(info) = self.store.take_cancelled(&key)? else {
            return Err(ExecutionError::NoResumableState(key));
        };
        if let Some(text) = context.filter(|t| !t.trim().is_empty()) {
            self.store.stash_pending_context(&key, text.trim())?;
        }

        let mut plan = parse_plan_file(plan_path)?;
        let state = match self.store.load_execution_state(&key)? {
            Some(state) => state,
            None => {
                warn!(plan = %key, "execution state missing, rebuilding from cancellation record");
                let mut state = ExecutionState::new(&key, self.config.mode, self.store.now());
                for r in &info.results_so_far {
                    if r.success && r.task_id >= 1 && r.task_id <= info.paused_task_index {
                        state.completed_task_ids.insert(r.task_id - 1);
                    }
                }
                state.current_task_index = info.paused_task_index;
                state.results = info.results_so_far.clone();
                state
            }
        };
        if state.current_task_index != info.paused_task_index {
            warn!(
                plan = %key,
                state_index = state.current_task_index,
                cancelled_index = info.paused_task_index,
                "cancellation record and state disagree, using the state"
            );
        }
        state
            .validate_against(&plan)
            .map_err(|reason| ExecutionError::PlanMismatch {
                path: key.clone(),
                reason,
            })?;
        replay_statuses(&mut plan, &state)?;

        self.store.mark_active(&key)?;
        self.notifier.notify(&Notice::new(
            NoticeKind::Resumed,
            format!("Resuming task {}", state.current_task_index + 1),
            "Continuing with the context you provided.",
        ));
        self.drive_replayed(plan_path, plan, state, false, cancel)
            .await
    }

    async fn drive(
        &self,
        plan_path: &Path,
        mut plan: ExecutionPlan,
        state: ExecutionState,
        confirmed: bool,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        replay_statuses(&mut plan, &state)?;
        self.drive_replayed(plan_path, plan, state, confirmed, cancel)
            .await
    }

    /// The task loop. Task statuses in `plan` already reflect `state`.
    async fn drive_replayed(
        &self,
        plan_path: &Path,
        mut plan: ExecutionPlan,
        mut state: ExecutionState,
        mut confirmed: bool,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        let key = state.plan_path.clone();
        let gate = CheckpointGate::new(state.mode);

        while state.current_task_index < plan.len() {
            let index = state.current_task_index;
            if cancel.is_cancelled() || self.store.take_cancel_request(&key)? {
                cancel.cancel();
                return self.cancelled(&plan, state);
            }
            self.store.touch_active(&key)?;

            let task = plan.tasks[index].clone();
            let auto = match (gate.evaluate(&task, confirmed), &task) {
                (GateDecision::Proceed, Task::Auto(auto)) => auto,
                (GateDecision::AutoResolve(resolution), _) => {
                    self.apply_resolution(&mut plan, &mut state, resolution)?;
                    self.store.save_execution_state(&mut state)?;
                    continue;
                }
                (GateDecision::Pause(kind), _) => return self.paused(&plan, state, kind),
                (GateDecision::Proceed, other) => {
                    let kind = other.checkpoint_type().unwrap_or(CheckpointType::HumanVerify);
                    return self.paused(&plan, state, kind);
                }
            };
            confirmed = false;

            plan.tasks[index].advance(TaskStatus::Running)?;
            let mut context = self.store.take_pending_context(&key)?;
            let outcome = match self
                .run_auto_task(&plan, auto, &state, &mut context, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A later `resume` re-runs this task; it needs the same context.
                    if let Some(text) = &context
                        && let Err(err) = self.store.restore_pending_context(&key, text)
                    {
                        warn!(error = %err, "failed to restore task context");
                    }
                    return Err(self.abort(&mut state, e));
                }
            };

            match outcome {
                TaskOutcome::Completed(summary) => {
                    info!(task = auto.id, "task completed");
                    plan.tasks[index].advance(TaskStatus::Completed)?;
                    state.settle_current(
                        TaskStatus::Completed,
                        Some(ExecutionResult::ok(auto.id, summary)),
                    );
                }
                TaskOutcome::Failed(err) => {
                    warn!(task = auto.id, error = %err, "task failed");
                    plan.tasks[index].advance(TaskStatus::Failed)?;
                    self.report_failure(plan_path, &state, auto, &err);
                    state.settle_current(
                        TaskStatus::Failed,
                        Some(ExecutionResult::failed(auto.id, err.to_string())),
                    );
                }
                TaskOutcome::Cancelled => {
                    if let Some(text) = &context {
                        self.store.restore_pending_context(&key, text)?;
                    }
                    return self.cancelled(&plan, state);
                }
            }
            self.store.save_execution_state(&mut state)?;
        }

        self.store.clear_all(&key)?;
        let report = build_report(&plan, &state, RunOutcome::Completed);
        self.notifier.notify(&Notice::new(
            NoticeKind::Completed,
            "Plan finished",
            report.summary(),
        ));
        info!(plan = %key, "run completed");
        Ok(report)
    }

    /// One auto task with transient-failure retries. `Err` is reserved for
    /// run-ending errors. Context injected during an attempt is folded into
    /// `context` so later attempts see it too.
    async fn run_auto_task(
        &self,
        plan: &ExecutionPlan,
        task: &AutoTask,
        state: &ExecutionState,
        context: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, ExecutionError> {
        let policy = RetryPolicy::new(self.config.retry_attempts, self.config.retry_base());
        let output = GatedOutput::new(self.sink.clone(), cancel.clone());
        let orchestrator = Orchestrator {
            agent: self.agent.as_ref(),
            tools: &self.tools,
            store: &self.store,
            output: &output,
            max_iterations: self.config.max_iterations,
            plan_path: &state.plan_path,
            heartbeat: self.store.heartbeat_interval(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(task = task.id, attempt, "running task attempt");
            let mut run = orchestrator
                .run_task(plan, task, &state.decisions_made, context.as_deref(), cancel)
                .await?;
            if let Some(extra) = run.injected.take() {
                *context = Some(match context.take() {
                    Some(base) => format!("{base}\n\n{extra}"),
                    None => extra,
                });
            }
            if run.stop == LoopStop::Cancelled {
                debug!(task = task.id, dropped = output.dropped(), "attempt cancelled");
                return Ok(TaskOutcome::Cancelled);
            }

            match classify(&run.transcript, self.config.snippet_chars) {
                Classification::Clean if run.stop == LoopStop::IterationCap => {
                    return Ok(TaskOutcome::Failed(ExecutionError::VerifyFailure {
                        signature: "iteration cap".into(),
                        snippet: format!(
                            "stopped after {} model turns without finishing",
                            run.iterations
                        ),
                    }));
                }
                Classification::Clean => {
                    let summary = run
                        .final_text
                        .map(|t| cap(&t, 500))
                        .unwrap_or_else(|| format!("{} tool calls", run.tool_calls));
                    return Ok(TaskOutcome::Completed(summary));
                }
                Classification::Failure { signature, snippet } => {
                    return Ok(TaskOutcome::Failed(ExecutionError::VerifyFailure {
                        signature: signature.to_string(),
                        snippet,
                    }));
                }
                Classification::Transient { pattern, snippet } => {
                    if !policy.has_next(attempt) {
                        return Ok(TaskOutcome::Failed(ExecutionError::TransientTool {
                            attempts: attempt,
                            snippet,
                        }));
                    }
                    warn!(task = task.id, attempt, pattern, "transient failure, retrying");
                    if !policy.backoff(attempt, cancel).await {
                        return Ok(TaskOutcome::Cancelled);
                    }
                }
            }
        }
    }

    fn apply_resolution(
        &self,
        plan: &mut ExecutionPlan,
        state: &mut ExecutionState,
        resolution: Resolution,
    ) -> Result<(), ExecutionError> {
        let index = state.current_task_index;
        let Some(task) = plan.tasks.get_mut(index) else {
            return Err(ExecutionError::PlanMismatch {
                path: state.plan_path.clone(),
                reason: format!("no task at index {index}"),
            });
        };
        let id = task.id();
        match resolution {
            Resolution::Verified => {
                task.advance(TaskStatus::Completed)?;
                state.settle_current(TaskStatus::Completed, Some(ExecutionResult::ok(id, "verified")));
            }
            Resolution::Rejected(feedback) => {
                task.advance(TaskStatus::Failed)?;
                self.notifier.notify(&Notice::new(
                    NoticeKind::TaskFailed,
                    format!("Task {id} rejected"),
                    cap(&feedback, 300),
                ));
                state.settle_current(
                    TaskStatus::Failed,
                    Some(ExecutionResult::failed(id, format!("rejected: {feedback}"))),
                );
            }
            Resolution::Chose(option) => {
                task.advance(TaskStatus::Completed)?;
                state.decisions_made.insert(id, option.clone());
                state.settle_current(
                    TaskStatus::Completed,
                    Some(ExecutionResult::ok(id, format!("chose {option}"))),
                );
            }
            Resolution::Skipped => {
                task.advance(TaskStatus::Skipped)?;
                state.settle_current(TaskStatus::Skipped, None);
            }
            Resolution::Confirmed => state.clear_pause(),
        }
        Ok(())
    }

    /// Surfaces a failed task; autonomous runs also append it to the issue log.
    fn report_failure(
        &self,
        plan_path: &Path,
        state: &ExecutionState,
        task: &AutoTask,
        err: &ExecutionError,
    ) {
        self.notifier.notify(&Notice::new(
            NoticeKind::TaskFailed,
            format!("Task {} failed: {}", task.id, task.name),
            cap(&err.to_string(), 400),
        ));
        if state.mode != ExecutionMode::Yolo {
            return;
        }

        let severity = match err {
            ExecutionError::TransientTool { .. } => Severity::Medium,
            _ => Severity::High,
        };
        let logger = IssueLogger::for_plan(&PathBuf::from(&state.plan_path));
        let title = format!("Task {} failed: {}", task.id, task.name);
        match logger.append(
            severity,
            task.id,
            &task.name,
            &title,
            &err.to_string(),
            self.store.now(),
        ) {
            Ok(record) => self.notifier.notify(&Notice::new(
                NoticeKind::IssueLogged,
                format!("Logged {}", record.id),
                logger.path().display().to_string(),
            )),
            Err(e) => {
                error!(plan = %plan_path.display(), error = %e, "could not write issue log");
                self.notifier.notify(&Notice::new(
                    NoticeKind::Error,
                    "Issue log write failed",
                    format!("task {} failure was not logged: {e}", task.id),
                ));
            }
        }
    }

    fn paused(
        &self,
        plan: &ExecutionPlan,
        mut state: ExecutionState,
        kind: CheckpointType,
    ) -> Result<RunReport, ExecutionError> {
        let index = state.current_task_index;
        state.pause(kind);
        self.store.save_execution_state(&mut state)?;
        self.store.clear_active(&state.plan_path)?;

        let name = plan.task(index).map(|t| t.name().to_string()).unwrap_or_default();
        let hint = match kind {
            CheckpointType::Decision => "resume with --decision <option-id>",
            CheckpointType::HumanVerify => "resume to approve, or --reject <feedback>",
            CheckpointType::ManualConfirm => "resume to run it, or --skip",
        };
        self.notifier.notify(&Notice::new(
            NoticeKind::Paused,
            format!("Paused at task {}: {name}", index + 1),
            format!("{kind} checkpoint; {hint}"),
        ));
        info!(plan = %state.plan_path, task = index + 1, %kind, "paused at checkpoint");
        Ok(build_report(plan, &state, RunOutcome::Paused { kind, index }))
    }

    fn cancelled(
        &self,
        plan: &ExecutionPlan,
        mut state: ExecutionState,
    ) -> Result<RunReport, ExecutionError> {
        let info = CancellationManager::new(&self.store).on_cancelled(&mut state, self.notifier.as_ref())?;
        Ok(build_report(
            plan,
            &state,
            RunOutcome::Cancelled {
                index: info.paused_task_index,
            },
        ))
    }

    /// Run-ending error: keep the position so `resume` can continue.
    fn abort(&self, state: &mut ExecutionState, err: ExecutionError) -> ExecutionError {
        error!(plan = %state.plan_path, error = %err, "run aborted");
        if let Err(e) = self.store.save_execution_state(state) {
            error!(error = %e, "failed to persist state after abort");
        }
        if let Err(e) = self.store.clear_active(&state.plan_path) {
            error!(error = %e, "failed to clear active marker after abort");
        }
        self.notifier.notify(&Notice::new(
            NoticeKind::Error,
            format!("Run stopped at task {}", state.current_task_index + 1),
            err.to_string(),
        ));
        err
    }
}

/// Brings in-memory task statuses in line with a persisted state.
fn replay_statuses(plan: &mut ExecutionPlan, state: &ExecutionState) -> Result<(), ExecutionError> {
    for index in 0..state.current_task_index.min(plan.len()) {
        let task = &mut plan.tasks[index];
        if task.status().is_terminal() {
            continue;
        }
        task.advance(state.settled_status(index))?;
    }
    Ok(())
}

fn build_report(plan: &ExecutionPlan, state: &ExecutionState, outcome: RunOutcome) -> RunReport {
    RunReport {
        plan_path: state.plan_path.clone(),
        outcome,
        results: state.results.clone(),
        statuses: plan.tasks.iter().map(|t| (t.id(), t.status())).collect(),
    }
}

#[cfg(test)]
mod tests;
