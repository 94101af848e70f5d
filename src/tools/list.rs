use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

use crate::llm::ToolDef;
use crate::tools::{ProjectRoot, Tool};

pub struct FsList {
    root: ProjectRoot,
}

impl FsList {
    pub fn new(root: ProjectRoot) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct Args {
    #[serde(default = "dot")]
    path: String,
    #[serde(default)]
    max_depth: Option<usize>,
    #[serde(default)]
    pattern: Option<String>,
}

fn dot() -> String {
    ".".into()
}

#[async_trait]
impl Tool for FsList {
    fn name(&self) -> &str {
        "fs_list"
    }

    fn tags(&self) -> &[&'static str] {
        &["code", "fs"]
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            self.name(),
            "Lists files and directories under a project path. `max_depth` defaults to 1; \
             `pattern` is a glob matched against the file name.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "max_depth": {"type": "integer"},
                    "pattern": {"type": "string"}
                }
            }),
        )
    }

    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let args: Args = serde_json::from_value(args).context("fs_list arguments")?;
        let start = self.root.resolve(&args.path)?;
        let pattern = args
            .pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .context("invalid glob pattern")?;

        let mut found = Vec::new();
        walk(&start, 1, args.max_depth.unwrap_or(1).max(1), &mut found)
            .with_context(|| format!("list {}", start.display()))?;
        found.sort();

        let entries: Vec<String> = found
            .into_iter()
            .filter(|p| match (&pattern, p.file_name()) {
                (Some(pat), Some(name)) => pat.matches(&name.to_string_lossy()),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .map(|p| {
                let rel = self.root.relative(&p);
                if p.is_dir() { format!("{rel}/") } else { rel }
            })
            .collect();
        Ok(entries.join("\n"))
    }
}

fn walk(dir: &Path, depth: usize, max_depth: usize, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_dir = path.is_dir();
        out.push(path.clone());
        if is_dir && depth < max_depth {
            walk(&path, depth + 1, max_depth, out)?;
        }
    }
    Ok(())
}
