//! Error types for remote execution

use std::time::Duration;
use thiserror::Error;

/// Errors raised while acquiring or using a pooled SSH connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection could not be established
    #[error("Failed to connect to {key}: {reason}")]
    Connect { key: String, reason: String },

    /// A fresh connection did not answer its liveness probe
    #[error("Connection to {0} failed its liveness check")]
    Liveness(String),

    /// The master connection did not come up in time
    #[error("Timed out after {timeout:?} connecting to {key}")]
    Timeout { key: String, timeout: Duration },

    /// The pool has been shut down
    #[error("Connection pool is shut down")]
    Shutdown,

    /// Local process error while talking to ssh
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when running a command through a `Shell`
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command `{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// Errors surfaced by the file browser
#[derive(Debug, Error)]
pub enum FileError {
    /// The requested path escapes the profile home directory
    #[error("Path escapes the home directory: {0}")]
    PathTraversal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Remote command failed: {0}")]
    Command(String),

    #[error("Unexpected output: {0}")]
    Parse(String),
}

impl From<ShellError> for FileError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::Connection(e) => FileError::Connection(e),
            ShellError::Io(e) => FileError::Command(e.to_string()),
            ShellError::Failed { stderr, .. } => FileError::Command(stderr),
        }
    }
}
