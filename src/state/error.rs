use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state record: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to parse state record: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to create state directory: {0}")]
    CreateDirError(std::io::Error),
    #[error("Failed to write state record: {0}")]
    WriteError(std::io::Error),
    #[error("Failed to delete state record: {0}")]
    DeleteError(std::io::Error),
    #[error("State backend unavailable: {0}")]
    Backend(String),
}
