use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Delivering an alert failed. Logged by the manager, never propagated to
    /// the run that raised it.
    #[error("Alert push failed: {0}")]
    Push(String),

    #[error("Stored alert is malformed: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, AlertError>;
