// ABOUTME: Error types for sandbox orchestration
// ABOUTME: One variant per failure class so tool handlers can report a precise textual error

use crate::engine::EngineError;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Language id outside the registered set
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    /// Missing or malformed required field
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Project directory or local source path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Image could not be pulled
    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    /// Environment could not be created
    #[error("Failed to create environment: {0}")]
    EnvironmentCreate(String),

    /// Environment was created but failed to start
    #[error("Failed to start environment {id}: {reason}")]
    EnvironmentStart { id: String, reason: String },

    /// Waiting for completion failed or was cancelled
    #[error("Error waiting for environment {id}: {reason}")]
    Wait {
        id: String,
        reason: String,
        cancelled: bool,
    },

    /// Logs could not be fetched or decoded
    #[error("Failed to get environment logs: {0}")]
    LogRetrieval(String),

    /// Building, transferring or extracting an archive failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Local filesystem permission problem
    #[error("Permission error: {0}")]
    Permission(String),

    /// Command execution inside a running environment failed
    #[error("Failed to execute command: {0}")]
    Exec(String),

    /// Stop or remove failed
    #[error("Failed to stop environment {id}: {reason}")]
    Stop { id: String, reason: String },

    /// Environments could not be enumerated
    #[error("Failed to list environments: {0}")]
    List(String),

    /// Engine does not know the identifier or name
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Build the error reported when a wait is aborted by its parent request
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::Wait {
            id: id.into(),
            reason: "operation cancelled".to_string(),
            cancelled: true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Wait {
                cancelled: true,
                ..
            }
        )
    }

    /// Map an engine failure onto the taxonomy, keeping not-found distinct
    pub(crate) fn from_engine(err: EngineError, map: impl FnOnce(String) -> Self) -> Self {
        match err {
            EngineError::NotFound(what) => Self::EnvironmentNotFound(what),
            other => map(other.to_string()),
        }
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
