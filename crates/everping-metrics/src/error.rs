use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid sample {key}={value}: {reason}")]
    InvalidSample {
        key: String,
        value: f64,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, MetricsError>;
