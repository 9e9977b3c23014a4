use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Chunk {chunk_index} processing failed: {message}")]
    ChunkProcessing { chunk_index: usize, message: String },

    #[error("Chunk {chunk_index} timed out after {seconds}s")]
    ChunkTimeout { chunk_index: usize, seconds: u64 },

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Checkpoint I/O error: {0}")]
    CheckpointIo(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for EngineError {
    fn from(err: polars::error::PolarsError) -> Self {
        EngineError::Polars(err.to_string())
    }
}

impl EngineError {
    /// Attach a chunk index to any error surfaced while processing a chunk
    pub fn for_chunk(self, chunk_index: usize) -> Self {
        match self {
            EngineError::ChunkProcessing { .. } | EngineError::ChunkTimeout { .. } => self,
            other => EngineError::ChunkProcessing {
                chunk_index,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
