#[derive(Debug, Clone, thiserror::Error)]
pub enum KzorpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no transaction open for this peer")]
    NoTransaction,

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KzorpError>;
