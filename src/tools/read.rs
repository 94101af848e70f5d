use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm::ToolDef;
use crate::tools::{ProjectRoot, Tool};

const DEFAULT_LIMIT: usize = 400;

pub struct FsRead {
    root: ProjectRoot,
}

impl FsRead {
    pub fn new(root: ProjectRoot) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct Args {
    path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for FsRead {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn tags(&self) -> &[&'static str] {
        &["code", "fs"]
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            self.name(),
            "Reads a text file inside the project. `start_line` is 1-based; `limit` caps the \
             number of lines returned (default 400).",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "limit": {"type": "integer"}
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let args: Args = serde_json::from_value(args).context("fs_read arguments")?;
        let path = self.root.resolve(&args.path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;

        let start = args.start_line.unwrap_or(1).max(1) - 1;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
        let total = content.lines().count();
        let mut out: String = content
            .lines()
            .skip(start)
            .take(limit)
            .collect::<Vec<_>>()
            .join("\n");
        if start + limit < total {
            out.push_str(&format!(
                "\n[truncated: showing lines {}-{} of {}]",
                start + 1,
                start + limit,
                total
            ));
        }
        Ok(out)
    }
}
