use super::*;
use crate::execution::cancellation::{CancellationManager, InputRoute};
use crate::execution::notify::{RecordingNotifier, RecordingSink};
use crate::llm::scripted::{ScriptedAgent, Step};
use crate::llm::{AssistantTurn, LlmErrorKind, ToolCall, ToolDef};
use crate::state::clock::ManualClock;
use crate::state::kv::MemoryKvStore;
use crate::tools::Tool;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in for a project check command: returns queued outputs in order.
#[derive(Clone, Default)]
struct CheckTool {
    outputs: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<AtomicUsize>,
    /// Text a user sends through `input` while the next check is running.
    input_during_call: Arc<Mutex<Option<(Arc<StateStore>, String, String)>>>,
}

impl CheckTool {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn send_input_during_next_call(&self, store: &Arc<StateStore>, key: &str, text: &str) {
        *self.input_during_call.lock().unwrap() =
            Some((store.clone(), key.to_string(), text.to_string()));
    }
}

#[async_trait]
impl Tool for CheckTool {
    fn name(&self) -> &str {
        "run_check"
    }

    fn tags(&self) -> &[&'static str] {
        &["code"]
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "run_check",
            "Run the project checks",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn call(&self, _args: serde_json::Value) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((store, key, text)) = self.input_during_call.lock().unwrap().take() {
            store.stash_pending_context(&key, &text)?;
        }
        let next = self.outputs.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| "ok".to_string()))
    }
}

struct Harness {
    _dir: TempDir,
    plan: PathBuf,
    key: String,
    agent: Arc<ScriptedAgent>,
    tool: CheckTool,
    store: Arc<StateStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    executor: PlanExecutor,
}

fn harness(plan_text: &str, steps: Vec<Step>, outputs: &[&str]) -> Harness {
    harness_with(plan_text, steps, outputs, ExecutionConfig::default())
}

fn harness_with(
    plan_text: &str,
    steps: Vec<Step>,
    outputs: &[&str],
    config: ExecutionConfig,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("01-01-PLAN.md");
    std::fs::write(&plan, plan_text).unwrap();
    let key = plan_key(&plan).unwrap();

    let agent = Arc::new(ScriptedAgent::new(steps));
    let tool = CheckTool::default();
    tool.outputs
        .lock()
        .unwrap()
        .extend(outputs.iter().map(|s| s.to_string()));
    let mut tools = ToolRegistry::new(Duration::from_secs(5));
    tools.register(tool.clone());

    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(StateStore::new(Arc::new(MemoryKvStore::new())).with_clock(clock.clone()));
    let notifier = Arc::new(RecordingNotifier::default());
    let config = ExecutionConfig {
        retry_base_ms: 1,
        ..config
    };
    let executor = PlanExecutor::new(
        agent.clone(),
        &tools,
        store.clone(),
        Arc::new(RecordingSink::default()),
        notifier.clone(),
        config,
    );
    Harness {
        _dir: dir,
        plan,
        key,
        agent,
        tool,
        store,
        clock,
        notifier,
        executor,
    }
}

/// One task attempt: the model runs the check, then reports back.
fn attempt(id: &str, reply: &str) -> [Step; 2] {
    [
        Step::Reply(AssistantTurn::calls(vec![ToolCall::new(id, "run_check", "{}")])),
        Step::Reply(AssistantTurn::text(reply)),
    ]
}

fn attempts(n: usize) -> Vec<Step> {
    (0..n).flat_map(|i| attempt(&format!("c{i}"), "done")).collect()
}

fn auto_plan(count: usize) -> String {
    let tasks: String = (1..=count)
        .map(|i| {
            format!(
                "<task type=\"auto\"><name>Task {i}: step {i}</name><action>Do step {i}</action><done>step {i} works</done></task>\n"
            )
        })
        .collect();
    format!("phase: 01-core\nplan: 01\n<objective>Build the core</objective>\n<tasks>\n{tasks}</tasks>\n")
}

const DECISION_PLAN: &str = r#"phase: 02-cache
plan: 01
<objective>Add caching</objective>
<tasks>
<task type="checkpoint:decision">
  <decision>Cache backend</decision>
  <options>
    <option id="redis"><name>Redis</name></option>
    <option id="memory"><name>In-process</name></option>
  </options>
</task>
<task type="auto"><name>Task 2: wire cache</name><action>Wire it</action></task>
</tasks>
"#;

const VERIFY_PLAN: &str = r#"phase: 03-ui
<objective>Polish the header</objective>
<tasks>
<task type="checkpoint:human-verify">
  <what-built>New header</what-built>
  <how-to-verify>1. Open the page
2. Check alignment</how-to-verify>
</task>
<task type="auto"><name>Task 2: follow up</name><action>Tidy</action></task>
</tasks>
"#;

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let h = harness(
        &auto_plan(1),
        attempts(3),
        &[
            "curl: (56) Connection reset by peer",
            "HTTP/1.1 503 Service Unavailable",
            "running 4 tests\n4 passed",
        ],
    );
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.status_of(1), Some(TaskStatus::Completed));
    assert_eq!(h.tool.calls(), 3);
    assert_eq!(h.agent.calls(), 6);
    assert!(h.store.load_execution_state(&h.key).unwrap().is_none());
    assert!(h.store.load_active(&h.key).unwrap().is_none());
}

#[tokio::test]
async fn retry_budget_comes_from_config() {
    let config = ExecutionConfig {
        retry_attempts: 2,
        ..ExecutionConfig::default()
    };
    let h = harness_with(
        &auto_plan(1),
        attempts(3),
        &["429 Too Many Requests", "429 Too Many Requests", "fine"],
        config,
    );
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.tool.calls(), 2);
    assert_eq!(report.status_of(1), Some(TaskStatus::Failed));
    assert!(report.results[0].error.as_deref().unwrap().contains("after 2 attempts"));
}

#[tokio::test]
async fn guided_decision_pauses_until_decided() {
    let h = harness(DECISION_PLAN, attempts(1), &[]);
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Paused {
            kind: CheckpointType::Decision,
            index: 0
        }
    );
    let state = h.store.load_execution_state(&h.key).unwrap().unwrap();
    assert!(state.paused_at_checkpoint);
    assert_eq!(state.checkpoint_type, Some(CheckpointType::Decision));
    assert_eq!(state.current_task_index, 0);
    assert!(h.store.load_active(&h.key).unwrap().is_none());
    assert_eq!(h.agent.calls(), 0);
    assert!(h.notifier.kinds().contains(&NoticeKind::Paused));

    let bad = HumanInput {
        decision: Some("sqlite".into()),
        ..HumanInput::default()
    };
    let err = h
        .executor
        .resume(&h.plan, &bad, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidDecision(_)));
    let state = h.store.load_execution_state(&h.key).unwrap().unwrap();
    assert_eq!(state.current_task_index, 0);
    assert!(state.paused_at_checkpoint);

    let good = HumanInput {
        decision: Some("memory".into()),
        ..HumanInput::default()
    };
    let report = h
        .executor
        .resume(&h.plan, &good, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.results[0].output.as_deref(), Some("chose memory"));
    assert_eq!(report.status_of(2), Some(TaskStatus::Completed));

    let system = h.agent.histories()[0][0].content.clone().unwrap();
    assert!(system.contains("Cache backend -> In-process (memory)"));
}

#[tokio::test]
async fn yolo_auto_resolves_checkpoints() {
    let plan = r#"phase: 04
<objective>Ship</objective>
<tasks>
<task type="checkpoint:decision">
  <decision>Queue</decision>
  <options><option id="sqs"><name>SQS</name></option><option id="nats"><name>NATS</name></option></options>
</task>
<task type="checkpoint:human-verify"><what-built>Queue consumer</what-built></task>
<task type="auto"><name>Task 3: deploy</name><action>Deploy</action></task>
</tasks>
"#;
    let h = harness(plan, attempts(1), &[]);
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Yolo, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.results[0].output.as_deref(), Some("chose sqs"));
    assert_eq!(report.results[1].output.as_deref(), Some("verified"));
    assert_eq!(report.count(TaskStatus::Completed), 3);
    assert!(!h.notifier.kinds().contains(&NoticeKind::Paused));
}

#[tokio::test]
async fn cancel_mid_task_then_resume_with_context() {
    let mut steps: Vec<Step> = attempt("c1", "step 1 done").into();
    steps.push(Step::Cancel);
    let h = harness(&auto_plan(2), steps, &[]);

    let cancel = CancellationToken::new();
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &cancel)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled { index: 1 });
    assert!(cancel.is_cancelled());

    let info = h.store.load_cancelled(&h.key).unwrap().unwrap();
    assert_eq!(info.paused_task_index, 1);
    assert_eq!(info.results_so_far.len(), 1);
    assert!(h.store.load_active(&h.key).unwrap().is_none());
    assert!(h.notifier.kinds().contains(&NoticeKind::Cancelled));

    h.clock.advance(chrono::Duration::minutes(4));
    for step in attempt("c2", "step 2 done") {
        h.agent.push(step);
    }
    let report = h
        .executor
        .resume_from_cancel(&h.plan, Some("use retries=5"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.status_of(1), Some(TaskStatus::Completed));
    assert_eq!(report.status_of(2), Some(TaskStatus::Completed));
    assert_eq!(report.results.len(), 2);

    let histories = h.agent.histories();
    let resumed_prompt = histories[3][1].content.clone().unwrap();
    assert!(resumed_prompt.starts_with("Task 2: step 2"));
    assert!(resumed_prompt.contains("Additional context from the user:\nuse retries=5"));
    assert!(h.store.load_cancelled(&h.key).unwrap().is_none());
}

#[tokio::test]
async fn input_routed_to_cancelled_run_becomes_context() {
    let h = harness(&auto_plan(1), vec![Step::Cancel], &[]);
    h.executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();

    let route = CancellationManager::new(&h.store)
        .route_input(&h.key, "the API key is in .env.local")
        .unwrap();
    assert_eq!(route, InputRoute::ResumeCancelled { index: 0 });

    for step in attempt("c1", "done") {
        h.agent.push(step);
    }
    let report = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let prompt = h.agent.histories()[1][1].content.clone().unwrap();
    assert!(prompt.contains("the API key is in .env.local"));
}

#[tokio::test]
async fn resume_after_window_is_rejected() {
    let h = harness(&auto_plan(2), vec![Step::Cancel], &[]);
    h.executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert!(h.store.load_cancelled(&h.key).unwrap().is_some());

    h.clock.advance(chrono::Duration::minutes(5));
    let err = h
        .executor
        .resume_from_cancel(&h.plan, Some("use retries=5"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::NoResumableState(_)));
    assert!(h.store.load_cancelled(&h.key).unwrap().is_none());
    assert!(h.store.load_execution_state(&h.key).unwrap().is_none());

    let err = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::NoResumableState(_)));
    assert_eq!(
        CancellationManager::new(&h.store)
            .route_input(&h.key, "use retries=5")
            .unwrap(),
        InputRoute::Idle
    );
}

#[tokio::test]
async fn yolo_failure_logs_issue_and_continues() {
    let h = harness(
        &auto_plan(3),
        attempts(5),
        &[
            "ok",
            "request timed out",
            "request timed out",
            "request timed out",
            "ok",
        ],
    );
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Yolo, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        report.statuses,
        vec![
            (1, TaskStatus::Completed),
            (2, TaskStatus::Failed),
            (3, TaskStatus::Completed)
        ]
    );
    assert_eq!(h.tool.calls(), 5);

    let issues = IssueLogger::for_plan(Path::new(&h.key)).read_all().unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].id, "ISS-001");
    assert_eq!(issues[0].task_id, 2);
    assert_eq!(issues[0].severity, Severity::Medium);
    assert!(issues[0].description.contains("after 3 attempts"));
    assert!(h.notifier.kinds().contains(&NoticeKind::IssueLogged));
}

#[tokio::test]
async fn failure_signature_overrides_model_claim() {
    let mut steps: Vec<Step> = attempt("c1", "All tests pass!").into();
    steps.extend(attempts(1));
    let h = harness(
        &auto_plan(2),
        steps,
        &["$ npm test\n PASS src/a.test.ts\n FAIL src/auth.test.ts\n  expected 200, got 500\n"],
    );
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status_of(1), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(2), Some(TaskStatus::Completed));
    let err = report.results[0].error.as_deref().unwrap();
    assert!(err.contains("test failure"));
    assert!(err.contains("FAIL src/auth.test.ts"));
    // Guided runs show the failure instead of logging it.
    assert!(!crate::execution::issues::issue_log_path(&h.plan).exists());
    let kinds = h.notifier.kinds();
    assert!(kinds.contains(&NoticeKind::TaskFailed));
    assert!(!kinds.contains(&NoticeKind::IssueLogged));
}

#[tokio::test]
async fn manual_mode_confirms_each_task() {
    let h = harness(&auto_plan(2), attempts(1), &[]);
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Manual, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Paused {
            kind: CheckpointType::ManualConfirm,
            index: 0
        }
    );
    assert_eq!(h.agent.calls(), 0);

    let report = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Paused {
            kind: CheckpointType::ManualConfirm,
            index: 1
        }
    );
    assert_eq!(report.status_of(1), Some(TaskStatus::Completed));

    let skip = HumanInput {
        skip: true,
        ..HumanInput::default()
    };
    let report = h
        .executor
        .resume(&h.plan, &skip, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.status_of(2), Some(TaskStatus::Skipped));
    assert_eq!(h.tool.calls(), 1);
}

#[tokio::test]
async fn rejected_verification_fails_task_and_continues() {
    let h = harness(VERIFY_PLAN, attempts(1), &[]);
    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Paused {
            kind: CheckpointType::HumanVerify,
            index: 0
        }
    );

    let reject = HumanInput {
        reject: Some("header overlaps the nav".into()),
        ..HumanInput::default()
    };
    let report = h
        .executor
        .resume(&h.plan, &reject, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.status_of(1), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(2), Some(TaskStatus::Completed));
    assert!(
        report.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("header overlaps the nav")
    );
}

#[tokio::test]
async fn edited_plan_is_a_mismatch_on_resume() {
    let h = harness(DECISION_PLAN, vec![], &[]);
    h.executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();

    std::fs::write(&h.plan, auto_plan(2)).unwrap();
    let input = HumanInput {
        decision: Some("redis".into()),
        ..HumanInput::default()
    };
    let err = h
        .executor
        .resume(&h.plan, &input, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::PlanMismatch { .. }));
}

#[tokio::test]
async fn unavailable_model_keeps_position_for_resume() {
    let mut steps: Vec<Step> = attempt("c1", "step 1 done").into();
    steps.push(Step::Fail(LlmErrorKind::Server));
    let h = harness(&auto_plan(2), steps, &[]);

    let err = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::ModelUnavailable(_)));
    let state = h.store.load_execution_state(&h.key).unwrap().unwrap();
    assert_eq!(state.current_task_index, 1);
    assert!(!state.paused_at_checkpoint);
    assert!(h.store.load_active(&h.key).unwrap().is_none());
    assert!(h.notifier.kinds().contains(&NoticeKind::Error));

    for step in attempt("c2", "step 2 done") {
        h.agent.push(step);
    }
    let report = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.count(TaskStatus::Completed), 2);
}

#[tokio::test]
async fn input_sent_mid_task_reaches_the_retried_attempt() {
    let h = harness(&auto_plan(1), attempts(2), &["request timed out", "ok"]);
    h.tool
        .send_input_during_next_call(&h.store, &h.key, "use retries=5");

    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(h.tool.calls(), 2);

    let histories = h.agent.histories();
    assert_eq!(histories.len(), 4);
    // Injected into the first attempt once the check returned...
    assert!(histories[1].iter().any(|m| {
        m.role == "user" && m.content.as_deref().is_some_and(|c| c.contains("use retries=5"))
    }));
    // ...and carried into the retry's task prompt.
    let retry_prompt = histories[2][1].content.clone().unwrap();
    assert!(retry_prompt.contains("Additional context from the user:\nuse retries=5"));
}

#[tokio::test]
async fn input_sent_mid_task_survives_cancellation() {
    let mut steps: Vec<Step> = vec![Step::Reply(AssistantTurn::calls(vec![ToolCall::new(
        "c1",
        "run_check",
        "{}",
    )]))];
    steps.push(Step::Cancel);
    let h = harness(&auto_plan(1), steps, &[]);
    h.tool
        .send_input_during_next_call(&h.store, &h.key, "the fixture lives in tests/data");

    let report = h
        .executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled { index: 0 });
    assert_eq!(
        h.store.peek_pending_context(&h.key).unwrap().as_deref(),
        Some("the fixture lives in tests/data")
    );

    for step in attempt("c2", "done") {
        h.agent.push(step);
    }
    let report = h
        .executor
        .resume_from_cancel(&h.plan, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let prompt = h.agent.histories()[2][1].content.clone().unwrap();
    assert!(prompt.contains("the fixture lives in tests/data"));
}

#[tokio::test]
async fn unavailable_model_keeps_resume_context() {
    let h = harness(&auto_plan(1), vec![Step::Cancel], &[]);
    h.executor
        .run(&h.plan, ExecutionMode::Guided, &CancellationToken::new())
        .await
        .unwrap();

    h.agent.push(Step::Fail(LlmErrorKind::Server));
    let err = h
        .executor
        .resume_from_cancel(&h.plan, Some("use retries=5"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::ModelUnavailable(_)));
    assert_eq!(
        h.store.peek_pending_context(&h.key).unwrap().as_deref(),
        Some("use retries=5")
    );

    for step in attempt("c1", "done") {
        h.agent.push(step);
    }
    let report = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let prompt = h.agent.histories()[2][1].content.clone().unwrap();
    assert!(prompt.contains("Additional context from the user:\nuse retries=5"));
}

#[tokio::test]
async fn cancel_request_is_honoured_at_task_boundary() {
    let h = harness(&auto_plan(1), attempts(1), &[]);
    h.executor
        .run(&h.plan, ExecutionMode::Manual, &CancellationToken::new())
        .await
        .unwrap();

    h.store.request_cancel(&h.key).unwrap();
    let cancel = CancellationToken::new();
    let report = h
        .executor
        .resume(&h.plan, &HumanInput::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled { index: 0 });
    assert!(cancel.is_cancelled());
    assert_eq!(h.agent.calls(), 0);
    assert!(h.store.load_cancelled(&h.key).unwrap().is_some());
}

#[tokio::test]
async fn invalid_plan_never_starts() {
    let h = harness("phase: 01\n<objective>x</objective>\n", vec![], &[]);
    let err = h
        .executor
        .run(&h.plan, ExecutionMode::Yolo, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::PlanParse(_)));
    assert!(h.store.load_active(&h.key).unwrap().is_none());
    assert_eq!(h.agent.calls(), 0);
}
