use thiserror::Error;

#[derive(Error, Debug)]
pub enum StockMeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] coordinator::CoordinatorError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StockMeshError>;
