use anyhow::{Result, bail};
use std::path::{Component, Path, PathBuf};

/// The directory every built-in tool is confined to.
#[derive(Debug, Clone)]
pub struct ProjectRoot {
    root: PathBuf,
}

impl ProjectRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves `path` (relative to the root, or absolute inside it)
    /// without touching the filesystem. Paths that climb out are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    if !normalized.pop() {
                        bail!("path escapes project root: {path}");
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        if !normalized.starts_with(&self.root) {
            bail!("path escapes project root: {path}");
        }
        Ok(normalized)
    }

    /// Display form relative to the root.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}
