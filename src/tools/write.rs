use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm::ToolDef;
use crate::tools::{ProjectRoot, Tool};

pub struct FsWrite {
    root: ProjectRoot,
}

impl FsWrite {
    pub fn new(root: ProjectRoot) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct Args {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for FsWrite {
    fn name(&self) -> &str {
        "fs_write"
    }

    fn tags(&self) -> &[&'static str] {
        &["code", "fs"]
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            self.name(),
            "Writes or overwrites a text file inside the project, creating parent \
             directories as needed.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let args: Args = serde_json::from_value(args).context("fs_write arguments")?;
        if args.content.as_bytes().contains(&0) {
            bail!("binary content is not allowed");
        }
        let path = self.root.resolve(&args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent directories for {}", path.display()))?;
        }
        tokio::fs::write(&path, args.content.as_bytes())
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(format!(
            "wrote {} bytes to {}",
            args.content.len(),
            self.root.relative(&path)
        ))
    }
}
