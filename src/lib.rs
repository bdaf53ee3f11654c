use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store not ready: {0}")]
    NotReady(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub mod chat;
pub mod database;
pub mod embeddings;
pub mod ingest;
pub mod model;
pub mod retrieval;
pub mod server;
pub mod text;
