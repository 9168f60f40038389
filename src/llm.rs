//! Language model and embedding integration
//!
//! Provides the `CompletionProvider` and `EmbeddingProvider` seams plus
//! two concrete backends: an Ollama-style local HTTP client and an
//! OpenAI-compatible client covering the hosted providers.

use crate::config::{EmbeddingConfig, LlmConfig, LlmProvider};
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call generation options
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// Response from text generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub model: String,
    pub tokens_used: Option<u32>,
    pub finish_reason: Option<String>,
}

/// Trait for chat completion backends
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate a full response for a conversation
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse>;

    /// Generate a response as a token stream
    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<flume::Receiver<Result<String>>>;
}

/// Trait for embedding backends
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Build the configured completion provider
pub fn completion_provider(config: &LlmConfig) -> Arc<dyn CompletionProvider> {
    match config.provider {
        LlmProvider::LocalHttp => Arc::new(OllamaClient::new(config.clone())),
        LlmProvider::RemoteA | LlmProvider::RemoteB => {
            Arc::new(OpenAiCompatClient::new(config.clone()))
        }
    }
}

// ===================== Ollama (local-http) =====================

/// Ollama client implementation
pub struct OllamaClient {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: OllamaChatMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        // Streaming responses outlive the per-request timeout
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            stream_client,
            config,
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }
}

#[async_trait]
impl CompletionProvider for OllamaClient {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse> {
        debug!("Generating text with {} messages", messages.len());

        let request = OllamaChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            options: OllamaOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let response = self
            .client
            .post(self.api_url("chat"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::ConnectionFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("LLM API error ({}): {}", status, body);
            return Err(LlmError::GenerationFailed(format!("HTTP {}: {}", status, body)).into());
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(GenerationResponse {
            text: parsed.message.content,
            model: parsed.model,
            tokens_used: parsed.eval_count,
            finish_reason: parsed.done_reason,
        })
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<flume::Receiver<Result<String>>> {
        let request = OllamaChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            options: OllamaOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let response = self
            .stream_client
            .post(self.api_url("chat"))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::GenerationFailed(format!("HTTP {}: {}", status, body)).into());
        }

        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::ConnectionFailed(e.to_string()).into()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OllamaChatResponse>(&line) {
                        Ok(parsed) => {
                            if !parsed.message.content.is_empty()
                                && tx.send(Ok(parsed.message.content)).is_err()
                            {
                                return;
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("Skipping unparseable stream line: {}", e);
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Ollama embedding client bound to the embedding endpoint
pub struct OllamaEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbedRequest {
            model: &self.config.model,
            prompt: text,
        };

        let url = format!(
            "{}/api/embeddings",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(LlmError::EmbeddingFailed(format!("HTTP {}", status)).into());
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(parsed.embedding)
    }
}

// ================= OpenAI-compatible (remote-a/remote-b) =================

/// Client for hosted OpenAI-compatible chat APIs
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiMessage>,
    #[serde(default)]
    delta: Option<OpenAiMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    completion_tokens: Option<u32>,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            stream_client,
            config,
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatClient {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse> {
        let request = OpenAiChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::ConnectionFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("LLM API error ({}): {}", status, body);
            return Err(LlmError::GenerationFailed(format!("HTTP {}: {}", status, body)).into());
        }

        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("Empty choices".to_string()))?;

        Ok(GenerationResponse {
            text: choice
                .message
                .and_then(|m| m.content)
                .unwrap_or_default(),
            model: parsed.model,
            tokens_used: parsed.usage.and_then(|u| u.completion_tokens),
            finish_reason: choice.finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<flume::Receiver<Result<String>>> {
        let request = OpenAiChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .stream_client
            .post(self.chat_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::GenerationFailed(format!("HTTP {}: {}", status, body)).into());
        }

        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::ConnectionFailed(e.to_string()).into()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<OpenAiChatResponse>(payload) {
                        let token = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta)
                            .and_then(|d| d.content)
                            .unwrap_or_default();
                        if !token.is_empty() && tx.send(Ok(token)).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_message_serialization() {
        let message = Message::user("hello");
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, "{\"role\":\"user\",\"content\":\"hello\"}");
    }

    #[tokio::test]
    async fn test_ollama_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "qwen2.5:1.5b",
                "message": {"role": "assistant", "content": "hi there"},
                "done": true,
                "done_reason": "stop",
                "eval_count": 3
            })))
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: server.uri(),
            ..LlmConfig::default()
        };
        let client = OllamaClient::new(config);

        let response = client
            .generate(&[Message::user("hello")], &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(response.text, "hi there");
        assert_eq!(response.tokens_used, Some(3));
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2, 0.3]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            base_url: server.uri(),
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(config);

        let embedding = embedder.embed("hello").await.unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_openai_compat_generate_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: server.uri(),
            provider: LlmProvider::RemoteA,
            ..LlmConfig::default()
        };
        let client = OpenAiCompatClient::new(config);

        let result = client
            .generate(&[Message::user("hello")], &GenerationOptions::default())
            .await;
        assert!(result.is_err());
    }
}
