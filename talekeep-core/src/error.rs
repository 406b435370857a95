use thiserror::Error;

/// Error taxonomy for the operations core.
///
/// Variants are kinds, not sources: the HTTP surface maps them to status
/// codes (`NotFound` → 404, `AlreadyExists` → 409, `Invalid` → 400) and the
/// queue synthesizes `Timeout` and `Panicked` itself.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        CoreError::AlreadyExists(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        CoreError::Invalid(what.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::AlreadyExists(db.message().to_owned())
            }
            _ => CoreError::Store(err.to_string()),
        }
    }
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transient(err.to_string())
    }
}

impl From<talekeep_model::ModelError> for CoreError {
    fn from(err: talekeep_model::ModelError) -> Self {
        CoreError::Invalid(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
