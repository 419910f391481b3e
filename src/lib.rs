use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Embedding dimension mismatch: got {actual}, expected {expected}")]
    DimensionMismatch { actual: usize, expected: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Inference server error (status {status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Bad inference response: {0}")]
    BadResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RagError::NotFound("row not found".to_string()),
            other => RagError::Storage(other.to_string()),
        }
    }
}

pub mod chunker;
pub mod config;
pub mod database;
pub mod indexer;
pub mod inference;
pub mod retrieval;
pub mod server;
pub mod sources;
pub mod tokenizer;
