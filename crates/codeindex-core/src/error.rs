use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Pool timeout: {0}")]
    PoolTimeout(String),

    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Backend write error: {0}")]
    BackendWrite(String),

    #[error("Partial batch failure: {0}")]
    PartialBatchFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PersistenceError {
    /// Transient errors are worth retrying; everything else should surface
    /// to the caller unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistenceError::Connection(_)
                | PersistenceError::PoolTimeout(_)
                | PersistenceError::OperationTimeout(_)
                | PersistenceError::BackendWrite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
