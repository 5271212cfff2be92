//! Error types for the everping-executor crate.

use thiserror::Error;

/// Why a run did not end in `SUCCESS`.
///
/// `Clone` so the same error can be logged, stored on the run and handed to
/// the alert manager; I/O errors are therefore kept as text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The child exceeded its time budget and was killed.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("exited with code {code}")]
    NonZeroExit { code: i32 },

    /// The task names a job the registry does not know.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Reading the job file or writing the run log failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecError>;
