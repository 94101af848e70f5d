use crate::state::error::StateError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// The record families kept per plan path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    ExecutionState,
    Cancelled,
    ActiveMarker,
    PendingContext,
    CancelRequest,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::ExecutionState => "execution_state",
            RecordKind::Cancelled => "cancelled",
            RecordKind::ActiveMarker => "active",
            RecordKind::PendingContext => "pending_context",
            RecordKind::CancelRequest => "cancel_request",
        }
    }

    pub const ALL: [RecordKind; 5] = [
        RecordKind::ExecutionState,
        RecordKind::Cancelled,
        RecordKind::ActiveMarker,
        RecordKind::PendingContext,
        RecordKind::CancelRequest,
    ];
}

/// Raw JSON storage keyed by `(plan path, record kind)`.
///
/// Implementations only move strings around; expiry is decided by
/// [`crate::state::StateStore`] on read.
pub trait KvStore: Send + Sync {
    fn get(&self, plan_path: &str, kind: RecordKind) -> Result<Option<String>, StateError>;
    fn put(&self, plan_path: &str, kind: RecordKind, value: &str) -> Result<(), StateError>;
    fn delete(&self, plan_path: &str, kind: RecordKind) -> Result<(), StateError>;
}

/// One JSON file per record under `<root>/<plan digest>/<kind>.json`.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    pub(crate) root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            error!(?e, "Failed to create state directory: {:?}", root);
            StateError::CreateDirError(e)
        })?;
        Ok(Self { root })
    }

    fn plan_dir(&self, plan_path: &str) -> PathBuf {
        self.root.join(plan_digest(plan_path))
    }

    fn record_path(&self, plan_path: &str, kind: RecordKind) -> PathBuf {
        self.plan_dir(plan_path)
            .join(format!("{}.json", kind.as_str()))
    }
}

/// Stable directory name for a plan path.
pub fn plan_digest(plan_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_path.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

impl KvStore for FileKvStore {
    fn get(&self, plan_path: &str, kind: RecordKind) -> Result<Option<String>, StateError> {
        let path = self.record_path(plan_path, kind);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::ReadError(e)),
        }
    }

    fn put(&self, plan_path: &str, kind: RecordKind, value: &str) -> Result<(), StateError> {
        let dir = self.plan_dir(plan_path);
        fs::create_dir_all(&dir).map_err(StateError::CreateDirError)?;
        let path = self.record_path(plan_path, kind);
        debug!(path = %path.display(), kind = kind.as_str(), "writing state record");
        write_atomic(&path, value)
    }

    fn delete(&self, plan_path: &str, kind: RecordKind) -> Result<(), StateError> {
        let path = self.record_path(plan_path, kind);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::DeleteError(e)),
        }
    }
}

/// Temp file + rename so a reader never sees a half-written record.
fn write_atomic(path: &Path, contents: &str) -> Result<(), StateError> {
    let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp, contents).map_err(|e| {
        error!(?e, "Failed to write state record: {:?}", tmp);
        StateError::WriteError(e)
    })?;
    fs::rename(&tmp, path).map_err(StateError::WriteError)
}

#[cfg(test)]
pub use memory::MemoryKvStore;
