use crate::execution::error::ExecutionError;
use crate::planning::{CheckpointType, Task};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// How much a human is in the loop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Never pause; checkpoints resolve themselves.
    Yolo,
    /// Pause at checkpoint tasks only.
    #[default]
    Guided,
    /// Pause before every task.
    Manual,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Yolo => "yolo",
            ExecutionMode::Guided => "guided",
            ExecutionMode::Manual => "manual",
        }
    }

    pub fn is_autonomous(self) -> bool {
        self == ExecutionMode::Yolo
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo" => Ok(ExecutionMode::Yolo),
            "guided" => Ok(ExecutionMode::Guided),
            "manual" => Ok(ExecutionMode::Manual),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// How a gate was passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Verified,
    Rejected(String),
    Chose(String),
    Skipped,
    /// Manual-mode go-ahead for an auto task.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Pause(CheckpointType),
    AutoResolve(Resolution),
}

/// What a human supplied when resuming a paused run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HumanInput {
    pub decision: Option<String>,
    pub reject: Option<String>,
    pub skip: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointGate {
    mode: ExecutionMode,
}

impl CheckpointGate {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// `confirmed` is true when a manual-mode confirmation for this task has
    /// already been given.
    pub fn evaluate(&self, task: &Task, confirmed: bool) -> GateDecision {
        match task {
            Task::Auto(_) => {
                if self.mode == ExecutionMode::Manual && !confirmed {
                    GateDecision::Pause(CheckpointType::ManualConfirm)
                } else {
                    GateDecision::Proceed
                }
            }
            Task::CheckpointVerify(_) if self.mode == ExecutionMode::Yolo => {
                info!(task = task.id(), "auto-approving verification checkpoint");
                GateDecision::AutoResolve(Resolution::Verified)
            }
            Task::CheckpointDecision(t) if self.mode == ExecutionMode::Yolo => {
                match t.default_option() {
                    Some(opt) => {
                        info!(task = t.id, option = %opt.id, "auto-selecting default option");
                        GateDecision::AutoResolve(Resolution::Chose(opt.id.clone()))
                    }
                    None => {
                        warn!(task = t.id, "decision checkpoint has no options, skipping");
                        GateDecision::AutoResolve(Resolution::Skipped)
                    }
                }
            }
            Task::CheckpointVerify(_) => GateDecision::Pause(CheckpointType::HumanVerify),
            Task::CheckpointDecision(_) => GateDecision::Pause(CheckpointType::Decision),
        }
    }

    /// Turns resume input into a resolution for the task the run is paused at.
    pub fn resolve_human(
        &self,
        task: &Task,
        paused_at: CheckpointType,
        input: &HumanInput,
    ) -> Result<Resolution, ExecutionError> {
        if input.skip {
            if input.decision.is_some() || input.reject.is_some() {
                return Err(ExecutionError::InvalidDecision(
                    "--skip cannot be combined with --decision or --reject".into(),
                ));
            }
            return Ok(Resolution::Skipped);
        }

        match (paused_at, task) {
            (CheckpointType::Decision, Task::CheckpointDecision(t)) => {
                if input.reject.is_some() {
                    return Err(ExecutionError::InvalidDecision(
                        "--reject applies to verification checkpoints".into(),
                    ));
                }
                let Some(choice) = input.decision.as_deref() else {
                    let ids: Vec<&str> = t.options.iter().map(|o| o.id.as_str()).collect();
                    return Err(ExecutionError::InvalidDecision(format!(
                        "task {} needs --decision <{}>",
                        t.id,
                        ids.join("|")
                    )));
                };
                match t.option(choice) {
                    Some(opt) => Ok(Resolution::Chose(opt.id.clone())),
                    None => Err(ExecutionError::InvalidDecision(format!(
                        "task {} has no option `{choice}`",
                        t.id
                    ))),
                }
            }
            (CheckpointType::HumanVerify, Task::CheckpointVerify(_)) => {
                if input.decision.is_some() {
                    return Err(ExecutionError::InvalidDecision(
                        "--decision applies to decision checkpoints".into(),
                    ));
                }
                Ok(match &input.reject {
                    Some(feedback) => Resolution::Rejected(feedback.clone()),
                    None => Resolution::Verified,
                })
            }
            (CheckpointType::ManualConfirm, Task::Auto(_)) => {
                if input.decision.is_some() || input.reject.is_some() {
                    return Err(ExecutionError::InvalidDecision(
                        "a manual confirmation takes no --decision or --reject".into(),
                    ));
                }
                Ok(Resolution::Confirmed)
            }
            (kind, task) => Err(ExecutionError::PlanMismatch {
                path: String::new(),
                reason: format!(
                    "paused at a {kind} gate but task {} is `{}`",
                    task.id(),
                    task.type_attr()
                ),
            }),
        }
    }
}
