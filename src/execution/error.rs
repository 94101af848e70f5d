use crate::planning::{InvalidTransition, PlanParseError};
use crate::state::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("plan could not be parsed: {0}")]
    PlanParse(#[from] PlanParseError),
    #[error("transient tool failure persisted after {attempts} attempts: {snippet}")]
    TransientTool { attempts: usize, snippet: String },
    #[error("verification failed ({signature}): {snippet}")]
    VerifyFailure { signature: String, snippet: String },
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("cancellation observed")]
    CancellationObserved,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("nothing to resume for {0}")]
    NoResumableState(String),
    #[error("saved state for {path} no longer matches the plan: {reason}")]
    PlanMismatch { path: String, reason: String },
    #[error("invalid checkpoint input: {0}")]
    InvalidDecision(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("cannot resolve plan path {path}: {source}")]
    PlanRead {
        path: String,
        source: std::io::Error,
    },
}

impl ExecutionError {
    /// Failures that end one task but let the run move on.
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            ExecutionError::TransientTool { .. } | ExecutionError::VerifyFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_reason() {
        let e = ExecutionError::VerifyFailure {
            signature: "test failure".into(),
            snippet: "FAIL src/auth.test.ts".into(),
        };
        assert_eq!(
            e.to_string(),
            "verification failed (test failure): FAIL src/auth.test.ts"
        );
        assert!(e.is_task_local());

        let e: ExecutionError = PlanParseError::NoTasks.into();
        assert!(e.to_string().starts_with("plan could not be parsed"));
        assert!(!e.is_task_local());
    }
}
