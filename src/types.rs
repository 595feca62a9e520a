// Error taxonomy and shared result types

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Copy failure or connection hiccup; retried up to the attempt budget
    #[error("Transient transfer error: {0}")]
    Transient(String),

    /// Local and remote digests disagree after a copy
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Verification { expected: String, actual: String },

    /// An expected remote directory or archive is absent
    #[error("Remote state error: {0}")]
    RemoteState(String),

    #[error("Remote channel error: {0}")]
    Channel(String),

    #[error("Missing template: {}", .0.display())]
    MissingTemplate(PathBuf),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StageError {
    /// Whether the error consumes a retry attempt rather than aborting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::Transient(_) | StageError::Verification { .. } | StageError::Io(_)
        )
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;
