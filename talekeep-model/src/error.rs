use thiserror::Error;

/// Validation failures raised while constructing model values.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown operation status: {0}")]
    UnknownStatus(String),

    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("password hashing failed: {0}")]
    PasswordHash(String),
}
