pub mod cancellation;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod failure;
pub mod issues;
pub mod notify;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod retry;

pub use cancellation::{CancellationManager, InputRoute};
pub use checkpoint::{CheckpointGate, ExecutionMode, GateDecision, HumanInput, Resolution};
pub use error::ExecutionError;
pub use executor::{PlanExecutor, plan_key};
pub use issues::{IssueLogger, IssueRecord, Severity, issue_log_path, parse_issues};
pub use notify::{GatedOutput, Notice, NoticeKind, Notifier, OutputSink, StderrNotifier, StdoutSink};
pub use report::{RunOutcome, RunReport};
pub use retry::RetryPolicy;
