use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::llm::ToolDef;
use crate::tools::{ProjectRoot, Tool};

pub struct ExecuteBash {
    root: ProjectRoot,
}

impl ExecuteBash {
    pub fn new(root: ProjectRoot) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct Args {
    command: String,
}

#[async_trait]
impl Tool for ExecuteBash {
    fn name(&self) -> &str {
        "execute_bash"
    }

    fn tags(&self) -> &[&'static str] {
        &["code", "shell"]
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            self.name(),
            "Runs a bash command in the project root and returns combined stdout and stderr. \
             A non-zero exit is reported as a trailing `exit code N` line. Use it to build, \
             run tests, and inspect the repository.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"}
                },
                "required": ["command"]
            }),
        )
    }

    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let Args { command } = serde_json::from_value(args).context("execute_bash arguments")?;
        debug!(%command, "execute_bash");
        let output = Command::new("bash")
            .arg("-c")
            .arg(&command)
            .current_dir(self.root.path())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute command: {command}"))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if !output.status.success() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            match output.status.code() {
                Some(code) => text.push_str(&format!("exit code {code}")),
                None => text.push_str("exit code terminated by signal"),
            }
        }
        Ok(text)
    }
}
