//! Error handling for the ingestion and retrieval platform

use thiserror::Error;

/// Result type alias for the platform
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Main error type for the platform
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors related to language model, embedding, and vision operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Vision analysis failed: {0}")]
    VisionFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: operation took too long")]
    Timeout,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Errors related to session, vector, and cache storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Errors related to input extraction
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Empty extraction: {0}")]
    Empty(String),

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),
}

impl ArchiveError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchiveError::Llm(LlmError::Timeout)
                | ArchiveError::Llm(LlmError::ConnectionFailed(_))
                | ArchiveError::Store(StoreError::SearchFailed(_))
                | ArchiveError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            ArchiveError::Llm(_) => "llm",
            ArchiveError::Store(_) => "store",
            ArchiveError::Extract(_) => "extract",
            ArchiveError::Config(_) => "config",
            ArchiveError::InvalidInput(_) => "invalid_input",
            ArchiveError::Io(_) => "io",
            ArchiveError::Serialization(_) => "serialization",
            ArchiveError::Http(_) => "http",
            ArchiveError::Database(_) => "database",
            ArchiveError::Generic(_) => "generic",
            ArchiveError::Queue(_) => "queue",
            ArchiveError::NotFound(_) => "not_found",
        }
    }
}
