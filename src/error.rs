use thiserror::Error;

/// Failures talking to the key-value collaborator. Callers decide the fallback.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store timed out: {0}")]
    Timeout(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store payload could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Timeout(err.to_string())
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::ReadOnly) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("prediction {0} not found")]
    NotFound(String),

    #[error("prediction {0} already has an outcome")]
    AlreadyResolved(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid ensemble weights: {0}")]
    InvalidWeights(String),
}
