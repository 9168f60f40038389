//! RAG chat service: cached, history-aware retrieval answering

use crate::cache::ResponseCache;
use crate::llm::{CompletionProvider, EmbeddingProvider, GenerationOptions, Message};
use crate::memory::{MetadataFilter, VectorStore};
use crate::sessions::SessionStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

/// Conversation turns kept in the prompt
const MAX_HISTORY_TURNS: usize = 10;

const SYSTEM_PROMPT: &str = "You are the Archive Assistant, a helpful expert that answers \
questions based on the provided document context.\n\n\
INSTRUCTIONS:\n\
- Use ONLY the context provided to answer the user's question accurately.\n\
- For structured data (Excel/CSV), look for EXACT matches in the context.\n\
- If the answer is not in the context, say: \"I'm sorry, I don't have enough information in my knowledgebase to answer that.\"\n\
- NEVER make up or infer data that isn't explicitly stated in the context.\n\
- Be concise, clear, and professional.\n\
- Match the language of the context (Arabic or English).\n\
- When answering from Excel/CSV data, cite the specific row or sheet if available.";

/// Options accompanying one chat call
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub session_id: Option<String>,
    pub source_id: Option<String>,
    pub k: usize,
    pub use_history: bool,

    /// Query embedding supplied by the caller; enables the semantic
    /// cache probe and the cache embedding write
    pub query_embedding: Option<Vec<f32>>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            source_id: None,
            k: 4,
            use_history: true,
            query_embedding: None,
        }
    }
}

/// Chat answer with retrieval metadata
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    /// The generated answer
    pub answer: String,

    /// Deduplicated source references backing the answer
    pub sources: Vec<String>,

    /// Session the exchange belongs to
    pub session_id: String,

    /// Whether any context chunks were retrieved
    pub context_found: bool,

    /// End-to-end latency in milliseconds
    pub latency_ms: u64,

    /// Set when the answer came from the cache
    #[serde(rename = "_cached", default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,

    /// Set when the cache hit was a semantic match
    #[serde(
        rename = "_semantic_match",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub semantic_match: Option<bool>,

    /// Cosine similarity of the semantic match
    #[serde(rename = "_similarity", default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,

    /// Set when the LLM call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

/// Chat service wiring retrieval, history, the LLM, and the cache
pub struct ChatService {
    llm: Arc<dyn CompletionProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    memory: Arc<VectorStore>,
    sessions: Arc<SessionStore>,
    cache: Arc<ResponseCache>,
    temperature: f32,
    max_tokens: u32,
}

impl ChatService {
    pub fn new(
        llm: Arc<dyn CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        memory: Arc<VectorStore>,
        sessions: Arc<SessionStore>,
        cache: Arc<ResponseCache>,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            llm,
            embedder,
            memory,
            sessions,
            cache,
            temperature,
            max_tokens,
        }
    }

    /// Answer a chat message.
    ///
    /// Probes the cache, retrieves context and history in parallel,
    /// calls the LLM, persists the exchange, and writes the cache entry.
    /// LLM failures surface as a structured error answer, never as an
    /// `Err`.
    pub async fn chat(&self, message: &str, options: &ChatOptions) -> ChatResponse {
        let start = Instant::now();
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let source_id = options.source_id.as_deref();
        let message = message.trim();

        if message.is_empty() {
            return ChatResponse {
                answer: "Please provide a message.".to_string(),
                sources: Vec::new(),
                session_id,
                context_found: false,
                latency_ms: elapsed_ms(start),
                cached: None,
                semantic_match: None,
                similarity: None,
                error: Some(true),
            };
        }

        let k = options.k.clamp(1, 10);
        info!(
            "Chat request (session: {}, source: {:?}, k: {})",
            session_id, source_id, k
        );

        // Exact cache probe
        if let Ok(Some(hit)) = self.cache.get_response(message, source_id).await {
            if let Ok(mut cached) = serde_json::from_value::<ChatResponse>(hit.value) {
                cached.cached = Some(true);
                cached.latency_ms = elapsed_ms(start);
                return cached;
            }
        }

        // Semantic probe, only with a caller-provided embedding
        if let Some(embedding) = &options.query_embedding {
            if let Ok(Some(hit)) = self.cache.semantic_lookup(embedding, source_id).await {
                if let Ok(mut cached) = serde_json::from_value::<ChatResponse>(hit.value) {
                    cached.cached = Some(true);
                    cached.semantic_match = Some(true);
                    cached.similarity = hit.similarity;
                    cached.latency_ms = elapsed_ms(start);
                    return cached;
                }
            }
        }

        // Context and history fetch in parallel
        let track_history = options.use_history && session_id != "default";
        let (context, history) = tokio::join!(
            self.retrieve_context(message, k, Some(&session_id), source_id),
            self.fetch_history(&session_id, track_history)
        );
        let (context_text, sources) = context;
        let context_found = !context_text.is_empty();

        let prompt = build_rag_prompt(message, &context_text, &history);
        let generation = self
            .llm
            .generate(
                &[Message::user(prompt)],
                &GenerationOptions {
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                },
            )
            .await;

        let answer = match generation {
            Ok(response) => response.text.trim().to_string(),
            Err(e) => {
                error!("LLM error: {}", e);
                return ChatResponse {
                    answer: format!("Error: Failed to generate response. ({})", e),
                    sources: Vec::new(),
                    session_id,
                    context_found,
                    latency_ms: elapsed_ms(start),
                    cached: None,
                    semantic_match: None,
                    similarity: None,
                    error: Some(true),
                };
            }
        };

        if session_id != "default" {
            self.persist_exchange(&session_id, message, &answer).await;
        }

        let mut response = ChatResponse {
            answer,
            sources,
            session_id,
            context_found,
            latency_ms: elapsed_ms(start),
            cached: None,
            semantic_match: None,
            similarity: None,
            error: None,
        };

        // Cache write happens after response generation; embed the query
        // when the caller did not supply a vector
        let embedding = match &options.query_embedding {
            Some(embedding) => Some(embedding.clone()),
            None => self.embedder.embed(message).await.ok(),
        };
        if let Ok(value) = serde_json::to_value(&response) {
            if let Err(e) = self
                .cache
                .put_response(message, &value, source_id, embedding.as_deref())
                .await
            {
                warn!("Cache write failed: {}", e);
            }
        }

        response.latency_ms = elapsed_ms(start);
        response
    }

    /// Streaming variant: yields tokens as they arrive and appends the
    /// concatenated answer to history when the stream ends
    pub fn chat_stream(
        self: &Arc<Self>,
        message: &str,
        options: &ChatOptions,
    ) -> flume::Receiver<String> {
        let (tx, rx) = flume::unbounded();
        let service = Arc::clone(self);
        let message = message.trim().to_string();
        let options = options.clone();

        tokio::spawn(async move {
            if message.is_empty() {
                let _ = tx.send("Please provide a message.".to_string());
                return;
            }

            let session_id = options
                .session_id
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let source_id = options.source_id.as_deref();
            let k = options.k.clamp(1, 10);
            let track_history = options.use_history && session_id != "default";

            let (context, history) = tokio::join!(
                service.retrieve_context(&message, k, Some(&session_id), source_id),
                service.fetch_history(&session_id, track_history)
            );
            let (context_text, _sources) = context;

            let prompt = build_rag_prompt(&message, &context_text, &history);
            let stream = service
                .llm
                .generate_stream(
                    &[Message::user(prompt)],
                    &GenerationOptions {
                        temperature: service.temperature,
                        max_tokens: service.max_tokens,
                    },
                )
                .await;

            let receiver = match stream {
                Ok(receiver) => receiver,
                Err(e) => {
                    error!("Stream error: {}", e);
                    let _ = tx.send(format!("\n\nError: {}", e));
                    return;
                }
            };

            let mut full_response = String::new();
            while let Ok(token) = receiver.recv_async().await {
                match token {
                    Ok(token) => {
                        full_response.push_str(&token);
                        if tx.send(token).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(format!("\n\nError: {}", e));
                        return;
                    }
                }
            }

            if session_id != "default" && !full_response.is_empty() {
                service
                    .persist_exchange(&session_id, &message, &full_response)
                    .await;
            }
        });

        rx
    }

    /// Retrieve context chunks; failures degrade to an empty context
    async fn retrieve_context(
        &self,
        query: &str,
        k: usize,
        session_id: Option<&str>,
        source_id: Option<&str>,
    ) -> (String, Vec<String>) {
        let filter = MetadataFilter::scoped(session_id, source_id);

        match self.memory.query(query, k, &filter).await {
            Ok(results) => {
                let mut parts = Vec::new();
                let mut sources = Vec::new();
                for chunk in &results {
                    parts.push(chunk.content.clone());
                    let source = chunk
                        .metadata
                        .get("source")
                        .map(String::as_str)
                        .unwrap_or("unknown");
                    let doc_id = chunk
                        .metadata
                        .get("doc_id")
                        .map(String::as_str)
                        .unwrap_or("unknown");
                    let reference = format!("{} (ID: {})", source, doc_id);
                    if !sources.contains(&reference) {
                        sources.push(reference);
                    }
                }
                (parts.join("\n---\n"), sources)
            }
            Err(e) => {
                error!("Context retrieval failed: {}", e);
                (String::new(), Vec::new())
            }
        }
    }

    /// Format recent history for the prompt; empty when tracking is off
    async fn fetch_history(&self, session_id: &str, track: bool) -> String {
        if !track {
            return String::new();
        }

        match self
            .sessions
            .read_messages(session_id, MAX_HISTORY_TURNS * 2)
            .await
        {
            Ok(messages) => messages
                .iter()
                .map(|m| {
                    let role = if m.role == "user" { "User" } else { "Assistant" };
                    format!("{}: {}", role, m.content)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!("History fetch failed: {}", e);
                String::new()
            }
        }
    }

    async fn persist_exchange(&self, session_id: &str, message: &str, answer: &str) {
        if let Err(e) = self.sessions.append_message(session_id, "user", message).await {
            warn!("Failed to persist user message: {}", e);
        }
        if let Err(e) = self
            .sessions
            .append_message(session_id, "assistant", answer)
            .await
        {
            warn!("Failed to persist assistant message: {}", e);
        }
        debug!("Persisted exchange for session {}", session_id);
    }
}

fn build_rag_prompt(message: &str, context: &str, history: &str) -> String {
    let mut parts = vec![SYSTEM_PROMPT.to_string()];

    if !history.is_empty() {
        parts.push(format!("\nCONVERSATION HISTORY:\n{}", history));
    }

    if !context.is_empty() {
        parts.push(format!("\nDOCUMENT CONTEXT:\n{}", context));
    } else {
        parts.push("\nNOTE: No relevant context was found in the knowledgebase.".to_string());
    }

    parts.push(format!("\nUSER QUESTION:\n{}", message));
    parts.push("\nASSISTANT RESPONSE:".to_string());

    parts.join("\n")
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
