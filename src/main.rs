mod cli;
mod config;
mod execution;
mod llm;
mod logging;
mod planning;
mod state;
mod tools;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use crate::config::{AppConfig, CliOverrides};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "planwright",
    version,
    about = "Execute phase plans with a tool-calling model, pausing at human checkpoints"
)]
struct Cli {
    /// OpenAI-compatible API base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Model name
    #[arg(long, global = true)]
    model: Option<String>,

    /// API key (set via env OPENAI_API_KEY recommended)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Directory the tools are confined to (defaults to the current dir)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: cli::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let cfg = AppConfig::load(CliOverrides {
        base_url: cli.base_url,
        model: cli.model,
        api_key: cli.api_key,
        project_root: cli.project_root,
        log_level: cli.log_level,
        mode: cli.command.mode(),
    })?;
    logging::init_logging(&cfg.log_file, &cfg.log_level)?;
    info!(
        model = %cfg.model,
        base_url = %cfg.base_url,
        root = %cfg.project_root.display(),
        mode = %cfg.execution.mode,
        "app config"
    );

    cli::dispatch(cli.command, cfg).await
}
