use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The trigger definition or its timezone cannot be evaluated.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// No task with the given id or name exists in the store.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    /// Another worker claimed the run first.
    #[error("Run {run_id} was claimed by another worker")]
    ClaimConflict { run_id: i64 },

    /// A completion tried to move a run into a non-terminal state.
    #[error("Run {run_id} cannot finish as {status}")]
    InvalidTransition { run_id: i64, status: String },

    #[error("Stored row is malformed: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
