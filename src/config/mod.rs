use crate::execution::ExecutionMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const PROJECT_DIR: &str = ".planwright";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub project_root: PathBuf,
    pub llm: LlmConfig,
    pub execution: ExecutionConfig,
    pub log_file: PathBuf,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            log_file: project_root.join(PROJECT_DIR).join("planwright.log"),
            project_root,
            llm: LlmConfig::default(),
            execution: ExecutionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 300_000,
            max_retries: 5,
            retry_base_ms: 1000,
            retry_jitter_ms: 2000,
            respect_retry_after: true,
        }
    }
}

/// Knobs of the plan executor itself.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub max_iterations: usize,
    pub retry_attempts: usize,
    pub retry_base_ms: u64,
    pub tool_timeout_ms: u64,
    pub resume_window_secs: i64,
    pub activity_window_secs: i64,
    pub tool_tag: String,
    pub state_dir: PathBuf,
    pub snippet_chars: usize,
    pub desktop_notifications: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Guided,
            max_iterations: 50,
            retry_attempts: 3,
            retry_base_ms: 1000,
            tool_timeout_ms: 120_000,
            resume_window_secs: 300,
            activity_window_secs: 60,
            tool_tag: "code".to_string(),
            state_dir: PathBuf::from(PROJECT_DIR).join("state"),
            snippet_chars: 400,
            desktop_notifications: false,
        }
    }
}

impl ExecutionConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub project_root: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub llm: Option<PartialLlmConfig>,
    pub execution: Option<PartialExecutionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
}

impl PartialLlmConfig {
    /// Fields set in `self` win over `other`.
    fn or(self, other: PartialLlmConfig) -> PartialLlmConfig {
        PartialLlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.or(other.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.or(other.request_timeout_ms),
            max_retries: self.max_retries.or(other.max_retries),
            retry_base_ms: self.retry_base_ms.or(other.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.or(other.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.or(other.respect_retry_after),
        }
    }

    fn resolve(self) -> LlmConfig {
        let d = LlmConfig::default();
        LlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(d.request_timeout_ms),
            max_retries: self.max_retries.unwrap_or(d.max_retries),
            retry_base_ms: self.retry_base_ms.unwrap_or(d.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.unwrap_or(d.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.unwrap_or(d.respect_retry_after),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialExecutionConfig {
    pub mode: Option<ExecutionMode>,
    pub max_iterations: Option<usize>,
    pub retry_attempts: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub resume_window_secs: Option<i64>,
    pub activity_window_secs: Option<i64>,
    pub tool_tag: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub snippet_chars: Option<usize>,
    pub desktop_notifications: Option<bool>,
}

impl PartialExecutionConfig {
    fn or(self, other: PartialExecutionConfig) -> PartialExecutionConfig {
        PartialExecutionConfig {
            mode: self.mode.or(other.mode),
            max_iterations: self.max_iterations.or(other.max_iterations),
            retry_attempts: self.retry_attempts.or(other.retry_attempts),
            retry_base_ms: self.retry_base_ms.or(other.retry_base_ms),
            tool_timeout_ms: self.tool_timeout_ms.or(other.tool_timeout_ms),
            resume_window_secs: self.resume_window_secs.or(other.resume_window_secs),
            activity_window_secs: self.activity_window_secs.or(other.activity_window_secs),
            tool_tag: self.tool_tag.or(other.tool_tag),
            state_dir: self.state_dir.or(other.state_dir),
            snippet_chars: self.snippet_chars.or(other.snippet_chars),
            desktop_notifications: self.desktop_notifications.or(other.desktop_notifications),
        }
    }

    fn resolve(self, project_root: &Path) -> ExecutionConfig {
        let d = ExecutionConfig::default();
        ExecutionConfig {
            mode: self.mode.unwrap_or(d.mode),
            max_iterations: self.max_iterations.unwrap_or(d.max_iterations).max(1),
            retry_attempts: self.retry_attempts.unwrap_or(d.retry_attempts).max(1),
            retry_base_ms: self.retry_base_ms.unwrap_or(d.retry_base_ms),
            tool_timeout_ms: self.tool_timeout_ms.unwrap_or(d.tool_timeout_ms),
            resume_window_secs: self.resume_window_secs.unwrap_or(d.resume_window_secs),
            activity_window_secs: self.activity_window_secs.unwrap_or(d.activity_window_secs),
            tool_tag: self.tool_tag.unwrap_or(d.tool_tag),
            state_dir: project_root.join(self.state_dir.unwrap_or(d.state_dir)),
            snippet_chars: self.snippet_chars.unwrap_or(d.snippet_chars),
            desktop_notifications: self
                .desktop_notifications
                .unwrap_or(d.desktop_notifications),
        }
    }
}

/// Values given on the command line; they beat every other layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub project_root: Option<PathBuf>,
    pub log_level: Option<String>,
    pub mode: Option<ExecutionMode>,
}

impl AppConfig {
    pub fn load(cli: CliOverrides) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let root_hint = cli.project_root.clone().unwrap_or(cwd);
        let project_cfg = load_project_config(&root_hint).unwrap_or_default();
        let file_cfg = load_file_config().unwrap_or_default();
        Ok(Self::merge(
            cli,
            |k| std::env::var(k).ok(),
            project_cfg,
            file_cfg,
            root_hint,
        ))
    }

    /// CLI > env > project file > global file > defaults.
    pub fn merge(
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
        project_cfg: FileConfig,
        file_cfg: FileConfig,
        cwd: PathBuf,
    ) -> Self {
        let api_key = cli
            .api_key
            .or_else(|| env("OPENAI_API_KEY"))
            .or(project_cfg.api_key)
            .or(file_cfg.api_key);
        let base_url = cli
            .base_url
            .or_else(|| env("OPENAI_BASE_URL"))
            .or(project_cfg.base_url)
            .or(file_cfg.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = cli
            .model
            .or_else(|| env("OPENAI_MODEL"))
            .or(project_cfg.model)
            .or(file_cfg.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let log_level = cli
            .log_level
            .or_else(|| env("PLANWRIGHT_LOG"))
            .or(project_cfg.log_level)
            .or(file_cfg.log_level)
            .unwrap_or_else(|| "info".to_string());
        let project_root = cli
            .project_root
            .or(project_cfg.project_root)
            .or(file_cfg.project_root)
            .unwrap_or(cwd);
        let log_file = project_cfg
            .log_file
            .or(file_cfg.log_file)
            .map(|p| project_root.join(p))
            .unwrap_or_else(|| project_root.join(PROJECT_DIR).join("planwright.log"));

        let llm = project_cfg
            .llm
            .unwrap_or_default()
            .or(file_cfg.llm.unwrap_or_default())
            .resolve();

        let env_mode = env("PLANWRIGHT_MODE").and_then(|m| match m.parse::<ExecutionMode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!(value = %m, error = %e, "ignoring PLANWRIGHT_MODE");
                None
            }
        });
        let mut execution = project_cfg
            .execution
            .unwrap_or_default()
            .or(file_cfg.execution.unwrap_or_default());
        execution.mode = cli.mode.or(env_mode).or(execution.mode);
        let execution = execution.resolve(&project_root);

        Self {
            base_url,
            model,
            api_key,
            project_root,
            llm,
            execution,
            log_file,
            log_level,
        }
    }
}

pub fn load_file_config() -> Result<FileConfig> {
    fn candidate_paths() -> Vec<PathBuf> {
        let mut v = Vec::new();
        if let Ok(p) = std::env::var("PLANWRIGHT_CONFIG") {
            v.push(PathBuf::from(p));
        }
        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            v.push(Path::new(&xdg_home).join("planwright/config.toml"));
        } else if let Some(config_dir) = dirs::config_dir() {
            v.push(config_dir.join("planwright/config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            v.push(home.join(".config/planwright/config.toml"));
        }
        v
    }

    for p in candidate_paths() {
        if p.exists() {
            let s = fs::read_to_string(&p)
                .with_context(|| format!("read config file: {}", p.display()))?;
            match toml::from_str::<FileConfig>(&s) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%e.to_string(), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .planwright/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(PROJECT_DIR).join("config.toml");

    if !project_config_path.exists() {
        return Ok(FileConfig::default());
    }
    let s = fs::read_to_string(&project_config_path).with_context(|| {
        format!(
            "read project config file: {}",
            project_config_path.display()
        )
    })?;
    match toml::from_str::<FileConfig>(&s) {
        Ok(cfg) => {
            info!(path=%project_config_path.display(), "loaded project config file");
            Ok(cfg)
        }
        Err(e) => {
            warn!(path=%project_config_path.display(), error=%e.to_string(), "parse project config failed");
            Ok(FileConfig::default())
        }
    }
}
