use crate::execution::error::ExecutionError;
use crate::execution::failure::cap;
use crate::execution::notify::GatedOutput;
use crate::execution::prompt;
use crate::llm::{ChatAgent, ChatMessage, LlmErrorKind, ToolCall, classify_error};
use crate::planning::{AutoTask, ExecutionPlan};
use crate::state::StateStore;
use crate::tools::ToolRegistry;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the tool loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The model stopped asking for tools.
    Finished,
    IterationCap,
    Cancelled,
}

/// Everything one attempt at an auto task produced.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub stop: LoopStop,
    /// Tool output and tool errors, in order; what the failure classifier reads.
    pub transcript: String,
    pub final_text: Option<String>,
    pub iterations: usize,
    pub tool_calls: usize,
    /// The model answered the first turn without calling a tool.
    pub tool_avoidance: bool,
    /// Context taken from the store and injected during this attempt.
    pub injected: Option<String>,
}

/// Drives one auto task through the model/tool loop.
pub struct Orchestrator<'a> {
    pub agent: &'a dyn ChatAgent,
    pub tools: &'a ToolRegistry,
    pub store: &'a StateStore,
    pub output: &'a GatedOutput,
    pub max_iterations: usize,
    pub plan_path: &'a str,
    /// Marker refresh period while a model or tool call is outstanding.
    pub heartbeat: Duration,
}

impl Orchestrator<'_> {
    pub async fn run_task(
        &self,
        plan: &ExecutionPlan,
        task: &AutoTask,
        decisions: &BTreeMap<usize, String>,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TaskRun, ExecutionError> {
        let defs = self.tools.definitions();
        let mut messages = vec![
            ChatMessage::system(prompt::system_prompt(plan, decisions)),
            ChatMessage::user(prompt::task_prompt(task, context)),
        ];
        let mut run = TaskRun {
            stop: LoopStop::IterationCap,
            transcript: String::new(),
            final_text: None,
            iterations: 0,
            tool_calls: 0,
            tool_avoidance: false,
            injected: None,
        };

        info!(task = task.id, name = %task.name, tools = defs.len(), "starting task loop");

        while run.iterations < self.max_iterations {
            if cancel.is_cancelled() {
                run.stop = LoopStop::Cancelled;
                return Ok(run);
            }
            run.iterations += 1;
            debug!(task = task.id, iteration = run.iterations, "task loop iteration");
            self.store.touch_active(self.plan_path)?;

            // Context pasted while this task was streaming.
            if run.iterations > 1
                && let Some(extra) = self.store.take_pending_context(self.plan_path)?
            {
                info!(task = task.id, "injecting context received mid-task");
                messages.push(ChatMessage::user(prompt::injected_context(&extra)));
                run.injected = Some(match run.injected.take() {
                    Some(prev) => format!("{prev}\n\n{extra}"),
                    None => extra,
                });
            }

            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    run.stop = LoopStop::Cancelled;
                    return Ok(run);
                }
                res = self.with_heartbeat(self.agent.complete(&messages, &defs, cancel)) => res,
            };
            let turn = match turn {
                Ok(t) => t,
                Err(e) => {
                    if cancel.is_cancelled() || classify_error(None, &e) == LlmErrorKind::Cancelled
                    {
                        run.stop = LoopStop::Cancelled;
                        return Ok(run);
                    }
                    error!(task = task.id, error = %format!("{e:#}"), "model call failed");
                    if let Some(text) = &run.injected
                        && let Err(err) = self.store.restore_pending_context(self.plan_path, text)
                    {
                        warn!(error = %err, "failed to restore injected context");
                    }
                    return Err(ExecutionError::ModelUnavailable(format!("{e:#}")));
                }
            };

            if let Some(text) = turn.narration() {
                self.output.write(text);
            }

            if turn.tool_calls.is_empty() {
                if run.iterations == 1 {
                    warn!(
                        task = task.id,
                        name = %task.name,
                        "model answered without calling any tool"
                    );
                    run.tool_avoidance = true;
                }
                run.final_text = turn.narration().map(str::to_string);
                messages.push(ChatMessage::assistant(turn.content, vec![]));
                run.stop = LoopStop::Finished;
                return Ok(run);
            }

            messages.push(ChatMessage::assistant(
                turn.content.clone(),
                turn.tool_calls.clone(),
            ));

            for call in &turn.tool_calls {
                if cancel.is_cancelled() {
                    run.stop = LoopStop::Cancelled;
                    return Ok(run);
                }
                self.output.write(&describe_call(call));
                let result = self.with_heartbeat(self.tools.dispatch(call)).await;
                run.tool_calls += 1;
                if cancel.is_cancelled() {
                    debug!(tool = %call.function.name, "discarding tool result after cancellation");
                    run.stop = LoopStop::Cancelled;
                    return Ok(run);
                }

                let content = match result {
                    Ok(out) => {
                        run.transcript.push_str(&out);
                        out
                    }
                    Err(e) => {
                        warn!(tool = %call.function.name, error = %e, "tool call failed");
                        run.transcript.push_str(&e);
                        json!({ "error": e }).to_string()
                    }
                };
                if !run.transcript.ends_with('\n') {
                    run.transcript.push('\n');
                }
                messages.push(ChatMessage::tool(call.id.clone(), content));
            }
        }

        warn!(task = task.id, iterations = run.iterations, "max tool iterations reached");
        run.stop = LoopStop::IterationCap;
        Ok(run)
    }

    /// Awaits `fut`, touching the active marker every `heartbeat` so a long
    /// tool or model call does not read as a dead run.
    async fn with_heartbeat<F: Future>(&self, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut beat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = beat.tick() => {
                    if let Err(e) = self.store.touch_active(self.plan_path) {
                        warn!(error = %e, "failed to refresh active marker");
                    }
                }
            }
        }
    }
}

fn describe_call(call: &ToolCall) -> String {
    format!(
        "→ {}({})",
        call.function.name,
        cap(call.function.arguments.trim(), 120)
    )
}
