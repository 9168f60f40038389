//! Configuration management for the ingestion and retrieval platform

use serde::{Deserialize, Serialize};

/// Main configuration for the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Chat LLM configuration
    pub llm: LlmConfig,

    /// Embedding model configuration
    pub embedding: EmbeddingConfig,

    /// Vision language model configuration
    pub vlm: VlmConfig,

    /// OCR configuration
    pub ocr: OcrConfig,

    /// Audio transcription configuration
    pub whisper: WhisperConfig,

    /// Web scraper configuration
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Remote document parser configuration
    #[serde(default)]
    pub parser: ParserConfig,

    /// Response cache configuration
    pub cache: CacheConfig,

    /// Chunking configuration
    pub chunker: ChunkerConfig,

    /// Durable store configuration (sessions, vectors, queue)
    pub store: StoreConfig,

    /// Job worker configuration
    pub worker: WorkerConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Supported completion providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmProvider {
    /// Local OpenAI-style HTTP server (Ollama)
    LocalHttp,
    /// Hosted OpenAI-compatible provider A
    RemoteA,
    /// Hosted OpenAI-compatible provider B
    RemoteB,
}

/// Chat language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name
    pub model: String,

    /// Sampling temperature for the primary parse and chat calls
    pub temperature: f32,

    /// Base URL of the completion endpoint
    pub base_url: String,

    /// Provider backend
    pub provider: LlmProvider,

    /// API key for hosted providers
    #[serde(default)]
    pub api_key: String,

    /// Maximum tokens for generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model name
    pub model: String,

    /// Base URL of the embedding endpoint
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
}

/// Vision language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Provider name ("remote-a", "remote-b", "local")
    pub provider: String,

    /// Model name; unknown models fall back to the provider default
    pub model: String,

    /// Chat-completions endpoint URL
    pub api_url: String,

    /// API key for hosted providers
    #[serde(default)]
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_vlm_timeout")]
    pub timeout: u64,
}

/// OCR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Confidence threshold above which OCR output is accepted
    #[serde(default = "default_ocr_threshold")]
    pub threshold: f32,

    /// Whether the OCR engine may use a GPU
    #[serde(default)]
    pub gpu: bool,

    /// Endpoint of the OCR sidecar service
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,

    /// Per-image OCR timeout in seconds
    #[serde(default = "default_ocr_timeout")]
    pub timeout: u64,
}

/// Audio transcription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// Model size identifier
    pub model_size: String,

    /// Inference device ("cuda" or "cpu")
    pub device: String,

    /// Endpoint of the transcription service
    #[serde(default = "default_whisper_endpoint")]
    pub endpoint: String,

    /// Per-file transcription timeout in seconds
    #[serde(default = "default_whisper_timeout")]
    pub timeout: u64,
}

/// Web scraper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Request timeout in seconds
    #[serde(default = "default_scraper_timeout")]
    pub timeout: u64,

    /// User agent sent with scrape requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum response body size in bytes
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

/// Remote document parser configuration (pdf, word, powerpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Base URL of the parser service
    #[serde(default = "default_parser_url")]
    pub base_url: String,

    /// Per-document parse timeout in seconds
    #[serde(default = "default_parser_timeout")]
    pub timeout: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable or disable caching
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time-to-live for response entries in seconds
    #[serde(default = "default_response_ttl")]
    pub response_ttl: i64,

    /// Time-to-live for embedding entries in seconds
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl: i64,

    /// Cosine similarity threshold for semantic hits
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Token count per chunk
    #[serde(default = "default_token_size")]
    pub token_size: usize,

    /// Token overlap between adjacent chunks
    #[serde(default = "default_token_overlap")]
    pub token_overlap: usize,

    /// Hard character cap applied before embedding
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database URL for sessions, chat history, and the job queue
    pub database_url: String,

    /// SQLite database URL for the vector index
    pub vector_database_url: String,

    /// Default vector collection name
    #[serde(default = "default_collection")]
    pub collection: String,
}

/// Job worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent pipeline executions per task
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,

    /// Soft time limit per task in seconds (warn and continue)
    #[serde(default = "default_soft_limit")]
    pub soft_limit: u64,

    /// Hard time limit per task in seconds (kill)
    #[serde(default = "default_hard_limit")]
    pub hard_limit: u64,

    /// Bearer token attached to callback requests
    #[serde(default = "default_callback_token")]
    pub callback_token: String,

    /// Default callback URL when a task supplies none
    #[serde(default)]
    pub callback_url: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory for uploaded files awaiting the worker
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Root directory for document workspaces
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_vlm_timeout() -> u64 {
    120
}

fn default_ocr_threshold() -> f32 {
    0.70
}

fn default_ocr_endpoint() -> String {
    "http://localhost:8868/ocr".to_string()
}

fn default_ocr_timeout() -> u64 {
    60
}

fn default_whisper_endpoint() -> String {
    "http://localhost:9000/transcribe".to_string()
}

fn default_whisper_timeout() -> u64 {
    600
}

fn default_scraper_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Archive/1.0".to_string()
}

fn default_max_content_length() -> usize {
    10 * 1024 * 1024
}

fn default_parser_url() -> String {
    "http://localhost:8070".to_string()
}

fn default_parser_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_response_ttl() -> i64 {
    3600
}

fn default_embedding_ttl() -> i64 {
    86400
}

fn default_similarity_threshold() -> f32 {
    0.92
}

fn default_token_size() -> usize {
    512
}

fn default_token_overlap() -> usize {
    64
}

fn default_max_chars() -> usize {
    6000
}

fn default_collection() -> String {
    "global_memory".to_string()
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_soft_limit() -> u64 {
    3600
}

fn default_hard_limit() -> u64 {
    3660
}

fn default_callback_token() -> String {
    "ai_worker_token".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upload_dir() -> String {
    "temp/uploads".to_string()
}

fn default_workspace_dir() -> String {
    "temp/documents".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            vlm: VlmConfig::default(),
            ocr: OcrConfig::default(),
            whisper: WhisperConfig::default(),
            scraper: ScraperConfig::default(),
            parser: ParserConfig::default(),
            cache: CacheConfig::default(),
            chunker: ChunkerConfig::default(),
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "qwen2.5:1.5b".to_string(),
            temperature: 0.1,
            base_url: "http://localhost:11434".to_string(),
            provider: LlmProvider::LocalHttp,
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            timeout: default_llm_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            base_url: "http://localhost:11434".to_string(),
            timeout: default_llm_timeout(),
        }
    }
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            provider: "remote-b".to_string(),
            model: "pixtral-12b-2409".to_string(),
            api_url: "https://api.mistral.ai/v1/chat/completions".to_string(),
            api_key: String::new(),
            timeout: default_vlm_timeout(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            threshold: default_ocr_threshold(),
            gpu: false,
            endpoint: default_ocr_endpoint(),
            timeout: default_ocr_timeout(),
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_size: "large-v2".to_string(),
            device: "cpu".to_string(),
            endpoint: default_whisper_endpoint(),
            timeout: default_whisper_timeout(),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout: default_scraper_timeout(),
            user_agent: default_user_agent(),
            max_content_length: default_max_content_length(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            base_url: default_parser_url(),
            timeout: default_parser_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            response_ttl: default_response_ttl(),
            embedding_ttl: default_embedding_ttl(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            token_size: default_token_size(),
            token_overlap: default_token_overlap(),
            max_chars: default_max_chars(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:archive.db".to_string(),
            vector_database_url: "sqlite:vectors.db".to_string(),
            collection: default_collection(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
            callback_token: default_callback_token(),
            callback_url: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_dir: default_upload_dir(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl ArchiveConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.llm.base_url.starts_with("http") {
            return Err(anyhow::anyhow!("Invalid LLM base URL: {}", self.llm.base_url));
        }

        if self.llm.model.is_empty() {
            return Err(anyhow::anyhow!("LLM model name cannot be empty"));
        }

        if self.embedding.model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if !(0.0..=1.0).contains(&self.ocr.threshold) {
            return Err(anyhow::anyhow!("OCR threshold must be between 0.0 and 1.0"));
        }

        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "Cache similarity threshold must be between 0.0 and 1.0"
            ));
        }

        if self.chunker.token_size == 0 {
            return Err(anyhow::anyhow!("Chunk token size must be greater than 0"));
        }

        if self.chunker.token_overlap >= self.chunker.token_size {
            return Err(anyhow::anyhow!(
                "Chunk overlap must be smaller than the chunk size"
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(anyhow::anyhow!("Worker concurrency must be greater than 0"));
        }

        if self.worker.hard_limit < self.worker.soft_limit {
            return Err(anyhow::anyhow!(
                "Worker hard limit must not be below the soft limit"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ArchiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.response_ttl, 3600);
        assert_eq!(config.cache.embedding_ttl, 86400);
        assert_eq!(config.chunker.token_size, 512);
        assert_eq!(config.chunker.token_overlap, 64);
        assert_eq!(config.chunker.max_chars, 6000);
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ArchiveConfig::default();
        assert!(config.validate().is_ok());

        config.llm.base_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = ArchiveConfig::default();
        config.chunker.token_overlap = 512;
        assert!(config.validate().is_err());

        config = ArchiveConfig::default();
        config.worker.hard_limit = 10;
        config.worker.soft_limit = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_round_trip() {
        let json = serde_json::to_string(&LlmProvider::LocalHttp).unwrap();
        assert_eq!(json, "\"local-http\"");
        let parsed: LlmProvider = serde_json::from_str("\"remote-a\"").unwrap();
        assert_eq!(parsed, LlmProvider::RemoteA);
    }
}
