//! Document Ingestion and Retrieval Platform
//!
//! An end-to-end pipeline that turns heterogeneous inputs (office
//! documents, spreadsheets, images, audio/video, web pages, streaming
//! videos) into a structured, searchable knowledge base and answers
//! natural-language questions over it:
//! - Format-routed extraction with content-hash fast-tracking
//! - Hybrid OCR/VLM image understanding arbitrated by confidence
//! - LLM structuring into canonical document records
//! - Row-based, structure-aware, and token chunking into a vector index
//! - Cached, history-aware RAG chat with streaming
//! - A durable job queue and worker with callback notification
//!
//! # Example
//!
//! ```rust,no_run
//! use the_archive::{ArchiveConfig, ChatOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ArchiveConfig::default();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod sessions;
pub mod structuring;
pub mod tables;
pub mod text;
pub mod vision;
pub mod workspace;

// Re-export main types
pub use cache::{CacheHit, CacheStats, ResponseCache};
pub use chat::{ChatOptions, ChatResponse, ChatService};
pub use chunker::{ChunkBatch, Chunker};
pub use config::{
    ArchiveConfig, CacheConfig, ChunkerConfig, EmbeddingConfig, LlmConfig, LlmProvider,
    OcrConfig, ScraperConfig, ServerConfig, StoreConfig, VlmConfig, WhisperConfig, WorkerConfig,
};
pub use dedup::{FastTrack, FastTrackOutcome};
pub use error::{ArchiveError, ExtractError, LlmError, Result, StoreError};
pub use extract::{
    DocumentParser, Extraction, Extractor, ExtractorSet, IngestInput, InputKind, MediaFetcher,
    ParsedDocument, Transcriber,
};
pub use llm::{
    completion_provider, CompletionProvider, EmbeddingProvider, GenerationOptions,
    GenerationResponse, Message, OllamaClient, OllamaEmbedder, Role,
};
pub use memory::{ChunkSet, IndexSummary, MetadataFilter, ScoredChunk, VectorStore};
pub use pipeline::{content_hash, IngestOptions, IngestOutcome, Pipeline};
pub use queue::{FileRef, Job, JobQueue, TaskPayload, TaskResult, Worker};
pub use sessions::{ChatMessage, DocumentRecord, Session, SessionStore};
pub use structuring::StructuringAgent;
pub use tables::{ChartInfo, Table};
pub use vision::{ImageAnalyzer, ImageRecord, OcrEngine, VisionProvider, VlmClient};
pub use workspace::DocumentWorkspace;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
