use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl CoreError {
    /// Short error code string, stable across releases (used by the CLI exit path).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::UnknownVariant { .. } => "UNKNOWN_VARIANT",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
