mod common;
mod execute;
mod list;
mod read;
mod write;

pub use common::ProjectRoot;
pub use execute::ExecuteBash;
pub use list::FsList;
pub use read::FsRead;
pub use write::FsWrite;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::{ToolCall, ToolDef};

/// A capability the model may invoke: structured input in, text out.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Capability tags used to pick the tools offered for a task.
    fn tags(&self) -> &[&'static str];

    fn definition(&self) -> ToolDef;

    /// Per-tool limit; the registry default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: Vec::new(),
            default_timeout,
        }
    }

    /// `execute_bash`, `fs_read`, `fs_write` and `fs_list`, all confined to `root`.
    pub fn builtin(root: ProjectRoot, default_timeout: Duration) -> Self {
        let mut reg = Self::new(default_timeout);
        reg.register(ExecuteBash::new(root.clone()));
        reg.register(FsRead::new(root.clone()));
        reg.register(FsWrite::new(root.clone()));
        reg.register(FsList::new(root));
        reg
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(Arc::new(tool));
    }

    /// The subset carrying `tag`; `*` keeps everything.
    pub fn filtered(&self, tag: &str) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| tag == "*" || t.tags().iter().any(|x| *x == tag))
                .cloned()
                .collect(),
            default_timeout: self.default_timeout,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs one requested call. Every failure (unknown tool, bad JSON,
    /// tool error, timeout) comes back as `Err` text for the model.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<String, String> {
        let name = call.function.name.as_str();
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            warn!(tool = name, "model requested unknown tool");
            return Err(format!("unknown tool: {name}"));
        };

        let raw = call.function.arguments.trim();
        let args = if raw.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| format!("invalid arguments for {name}: {e}"))?
        };

        let limit = tool.timeout().unwrap_or(self.default_timeout);
        debug!(tool = name, timeout_ms = limit.as_millis() as u64, "dispatching tool call");
        match tokio::time::timeout(limit, tool.call(args)).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => {
                warn!(tool = name, "tool call timed out");
                Err(format!("{name} timed out after {}ms", limit.as_millis()))
            }
        }
    }
}
