//! Deterministic [`ChatAgent`] for driving the executor in tests.

use super::{AssistantTurn, ChatAgent, ChatMessage, LlmErrorKind, ToolDef};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Step {
    Reply(AssistantTurn),
    Fail(LlmErrorKind),
    /// Fires the run's cancel token, as a user pressing stop mid-stream would.
    Cancel,
}

#[derive(Debug, Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedAgent {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Every message history the agent was called with, in order.
    pub fn histories(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatAgent for ScriptedAgent {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDef],
        cancel: &CancellationToken,
    ) -> anyhow::Result<AssistantTurn> {
        if cancel.is_cancelled() {
            return Err(anyhow::Error::new(LlmErrorKind::Cancelled));
        }
        self.seen.lock().unwrap().push(messages.to_vec());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(turn)) => Ok(turn),
            Some(Step::Fail(kind)) => Err(anyhow::Error::new(kind)),
            Some(Step::Cancel) => {
                cancel.cancel();
                Err(anyhow::Error::new(LlmErrorKind::Cancelled))
            }
            None => Ok(AssistantTurn::text("All done.")),
        }
    }
}
