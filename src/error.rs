use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid name: '{0}'")]
    InvalidName(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Field '{0}' not found")]
    FieldNotFound(String),

    #[error("View '{0}' not found")]
    ViewNotFound(String),

    #[error("Index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Field '{0}' already exists")]
    FieldAlreadyExists(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Position {0} out of range")]
    InvalidPosition(u64),

    #[error("Corrupt fragment: {0}")]
    CorruptFragment(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Replica mismatch: {0}")]
    ReplicaMismatch(String),

    #[error("Invalid cache type: {0}")]
    InvalidCacheType(String),

    #[error("Invalid time quantum: {0}")]
    InvalidTimeQuantum(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    EncodingError(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DbError {
    /// Remote failures worth retrying before giving up on a replica.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::NetworkError(_) | DbError::Unavailable(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;
