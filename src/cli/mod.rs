//! Subcommand handlers.

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::execution::{
    CancellationManager, ExecutionMode, HumanInput, InputRoute, IssueLogger, PlanExecutor,
    RunOutcome, RunReport, StderrNotifier, StdoutSink, plan_key,
};
use crate::llm::OpenAIClient;
use crate::planning::parse_plan_file;
use crate::state::{FileKvStore, StateStore};
use crate::tools::{ProjectRoot, ToolRegistry};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Execute a plan from its first task
    Run {
        plan: PathBuf,
        /// yolo, guided or manual
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,
    },
    /// Continue a paused or cancelled run
    Resume {
        plan: PathBuf,
        /// Option id for a decision checkpoint
        #[arg(long, conflicts_with = "reject")]
        decision: Option<String>,
        /// Fail a verification checkpoint with this feedback
        #[arg(long)]
        reject: Option<String>,
        /// Skip the task the run is paused at
        #[arg(long, conflicts_with_all = ["decision", "reject"])]
        skip: bool,
    },
    /// Send context to a cancelled or running execution
    Input {
        plan: PathBuf,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Ask a running execution to stop at its next boundary
    Cancel { plan: PathBuf },
    /// Show saved execution state
    Status { plan: PathBuf },
    /// List issues logged by autonomous runs
    Issues { plan: PathBuf },
}

impl Command {
    /// Mode override carried by `run`, if any.
    pub fn mode(&self) -> Option<ExecutionMode> {
        match self {
            Command::Run { mode, .. } => *mode,
            _ => None,
        }
    }
}

pub async fn dispatch(cmd: Command, cfg: AppConfig) -> Result<()> {
    match cmd {
        Command::Run { plan, .. } => {
            let store = open_store(&cfg)?;
            let (executor, client) = build_executor(&cfg, store.clone())?;
            let cancel = watch_cancellation(store, plan_key(&plan)?);
            let report = executor.run(&plan, cfg.execution.mode, &cancel).await?;
            info!(tokens = client.get_tokens_used(), "run returned");
            print_report(&report);
            Ok(())
        }
        Command::Resume {
            plan,
            decision,
            reject,
            skip,
        } => {
            let store = open_store(&cfg)?;
            let (executor, client) = build_executor(&cfg, store.clone())?;
            let cancel = watch_cancellation(store, plan_key(&plan)?);
            let input = HumanInput {
                decision,
                reject,
                skip,
            };
            let report = executor.resume(&plan, &input, &cancel).await?;
            info!(tokens = client.get_tokens_used(), "resume returned");
            print_report(&report);
            Ok(())
        }
        Command::Input { plan, text } => input(&cfg, &plan, &text.join(" ")).await,
        Command::Cancel { plan } => cancel(&cfg, &plan),
        Command::Status { plan } => status(&cfg, &plan),
        Command::Issues { plan } => issues(&plan),
    }
}

fn open_store(cfg: &AppConfig) -> Result<Arc<StateStore>> {
    let kv = FileKvStore::new(&cfg.execution.state_dir)
        .with_context(|| format!("open state dir {}", cfg.execution.state_dir.display()))?;
    Ok(Arc::new(StateStore::new(Arc::new(kv)).with_windows(
        chrono::Duration::seconds(cfg.execution.resume_window_secs),
        chrono::Duration::seconds(cfg.execution.activity_window_secs),
    )))
}

fn build_executor(
    cfg: &AppConfig,
    store: Arc<StateStore>,
) -> Result<(PlanExecutor, Arc<OpenAIClient>)> {
    let api_key = cfg
        .api_key
        .clone()
        .context("OPENAI_API_KEY is not set (env, --api-key or config.toml)")?;
    let client = Arc::new(
        OpenAIClient::new(&cfg.base_url, api_key, &cfg.model)?.with_llm_config(cfg.llm.clone()),
    );
    let tools = ToolRegistry::builtin(
        ProjectRoot::new(&cfg.project_root),
        cfg.execution.tool_timeout(),
    );
    info!(tools = ?tools.names(), model = %cfg.model, "executor ready");
    let executor = PlanExecutor::new(
        client.clone(),
        &tools,
        store,
        Arc::new(StdoutSink),
        Arc::new(StderrNotifier::new(cfg.execution.desktop_notifications)),
        cfg.execution.clone(),
    );
    Ok((executor, client))
}

/// Token cancelled by Ctrl-C or by a `cancel` request from another process.
fn watch_cancellation(store: Arc<StateStore>, key: String) -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let on_request = token.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = on_request.cancelled() => break,
                _ = tick.tick() => match store.take_cancel_request(&key) {
                    Ok(true) => {
                        info!(plan = %key, "cancel requested by another invocation");
                        on_request.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to poll cancel requests"),
                },
            }
        }
    });

    token
}

fn print_report(report: &RunReport) {
    match report.outcome {
        // The stdout stream belongs to the cancelled run; the notice went to stderr.
        RunOutcome::Cancelled { .. } => eprint!("{}", report.summary()),
        _ => print!("{}", report.summary()),
    }
}

async fn input(cfg: &AppConfig, plan: &Path, text: &str) -> Result<()> {
    let key = plan_key(plan)?;
    let store = open_store(cfg)?;
    let route = CancellationManager::new(&store).route_input(&key, text)?;
    match route {
        InputRoute::Command(c) => {
            println!("`{c}` looks like a command; use the matching planwright subcommand instead.");
        }
        InputRoute::InjectedIntoActive => {
            println!("Context queued for the running task.");
        }
        InputRoute::Idle => {
            println!(
                "Nothing is waiting on {}; start it with `planwright run`.",
                plan.display()
            );
        }
        InputRoute::ResumeCancelled { index } => {
            println!("Resuming task {} with your context.", index + 1);
            let (executor, _client) = build_executor(cfg, store.clone())?;
            let cancel = watch_cancellation(store, key);
            let report = executor.resume_from_cancel(plan, None, &cancel).await?;
            print_report(&report);
        }
    }
    Ok(())
}

fn cancel(cfg: &AppConfig, plan: &Path) -> Result<()> {
    let key = plan_key(plan)?;
    let store = open_store(cfg)?;
    if store.load_active(&key)?.is_none() {
        println!("No running execution for {}.", plan.display());
        return Ok(());
    }
    store.request_cancel(&key)?;
    println!("Cancellation requested; the run pauses at its next boundary.");
    Ok(())
}

fn status(cfg: &AppConfig, plan: &Path) -> Result<()> {
    let key = plan_key(plan)?;
    let store = open_store(cfg)?;
    let now = store.now();
    let total = parse_plan_file(plan).map(|p| p.len()).ok();

    match store.load_execution_state(&key)? {
        None => println!("No saved execution state."),
        Some(state) => {
            let of = total.map(|t| format!(" of {t}")).unwrap_or_default();
            println!(
                "Task {}{of} ({} mode), run {}",
                state.current_task_index + 1,
                state.mode,
                state.run_id
            );
            println!(
                "  completed {}, skipped {}, results {}",
                state.completed_task_ids.len(),
                state.skipped_task_ids.len(),
                state.results.len()
            );
            for (task, option) in &state.decisions_made {
                println!("  decision for task {task}: {option}");
            }
            if let Some(kind) = state.checkpoint_type.filter(|_| state.paused_at_checkpoint) {
                println!("  paused at a {kind} checkpoint");
            }
            println!("  saved {}", state.saved_at.to_rfc3339());
        }
    }

    if let Some(info) = store.load_cancelled(&key)? {
        let left = (info.expires_at - now).num_seconds().max(0) as u64;
        println!(
            "Cancelled at task {}; resume window closes in {}",
            info.paused_task_index + 1,
            humantime::format_duration(Duration::from_secs(left))
        );
    }
    match store.load_active(&key)? {
        Some(marker) => {
            let idle = (now - marker.last_activity_at).num_seconds().max(0) as u64;
            println!(
                "Live run (pid {}), last activity {} ago",
                marker.pid,
                humantime::format_duration(Duration::from_secs(idle))
            );
        }
        None => println!("No live run."),
    }
    if let Some(text) = store.peek_pending_context(&key)? {
        println!("Pending context: {} chars", text.chars().count());
    }
    Ok(())
}

fn issues(plan: &Path) -> Result<()> {
    let key = plan_key(plan)?;
    let logger = IssueLogger::for_plan(Path::new(&key));
    let records = logger
        .read_all()
        .with_context(|| format!("read {}", logger.path().display()))?;
    if records.is_empty() {
        println!("No open issues.");
        return Ok(());
    }
    for r in records {
        println!(
            "{} [{}] task {} ({}): {}",
            r.id, r.severity, r.task_id, r.task_name, r.title
        );
        println!("    logged {}", r.timestamp.to_rfc3339());
    }
    Ok(())
}
