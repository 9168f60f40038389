//! REST API for the ingestion and retrieval platform
//!
//! Endpoints:
//! - `POST /extract` queues an ingestion task (multipart)
//! - `POST /chat` and `POST /chat/stream` answer questions over the index
//! - `GET|DELETE /chat/history/{session_id}` manage conversation history
//! - `GET|DELETE /documents` inspect and remove indexed documents
//! - `GET /health` liveness probe

use crate::cache::ResponseCache;
use crate::chat::{ChatOptions, ChatResponse, ChatService};
use crate::config::ArchiveConfig;
use crate::memory::{MetadataFilter, VectorStore};
use crate::pipeline::Pipeline;
use crate::queue::{FileRef, JobQueue, TaskPayload};
use crate::sessions::SessionStore;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The ingestion pipeline
    pub pipeline: Arc<Pipeline>,
    /// Chat service
    pub chat: Arc<ChatService>,
    /// Session and chat history store
    pub sessions: Arc<SessionStore>,
    /// Vector index
    pub memory: Arc<VectorStore>,
    /// Response cache
    pub cache: Arc<ResponseCache>,
    /// Job queue feeding the worker
    pub queue: Arc<JobQueue>,
    /// Loaded configuration
    pub config: Arc<ArchiveConfig>,
}

impl AppState {
    /// Wire the full service graph from configuration.
    ///
    /// Returns the state plus the worker; callers decide whether to run
    /// the worker in-process or as a separate daemon.
    pub async fn from_config(
        config: ArchiveConfig,
    ) -> crate::error::Result<(Self, Arc<crate::queue::Worker>)> {
        use crate::chunker::Chunker;
        use crate::extract::media::{HttpTranscriber, YtDlpFetcher};
        use crate::extract::parser::HttpParserClient;
        use crate::extract::ExtractorSet;
        use crate::llm::{completion_provider, OllamaEmbedder};
        use crate::queue::Worker;
        use crate::structuring::StructuringAgent;
        use crate::vision::{HttpOcrClient, ImageAnalyzer, VlmClient};

        config
            .validate()
            .map_err(|e| crate::error::ArchiveError::Config(e.to_string()))?;

        let llm = completion_provider(&config.llm);
        let embedder = Arc::new(OllamaEmbedder::new(config.embedding.clone()));

        let memory = Arc::new(
            VectorStore::connect(
                &config.store.vector_database_url,
                &config.store.collection,
                embedder.clone(),
                config.chunker.max_chars,
            )
            .await?,
        );
        let sessions = Arc::new(SessionStore::connect(&config.store.database_url).await?);
        let cache = Arc::new(
            ResponseCache::connect(&config.store.database_url, config.cache.clone()).await?,
        );
        let queue = Arc::new(
            JobQueue::connect(
                &config.store.database_url,
                "extraction_queue",
                config.worker.hard_limit as i64,
            )
            .await?,
        );

        let extractors = ExtractorSet::standard(
            config.scraper.clone(),
            Arc::new(HttpParserClient::new(config.parser.clone())),
            Arc::new(HttpTranscriber::new(config.whisper.clone())),
            Arc::new(YtDlpFetcher),
        );
        let analyzer = ImageAnalyzer::new(
            Arc::new(HttpOcrClient::new(config.ocr.clone())),
            Arc::new(VlmClient::new(config.vlm.clone())?),
            config.ocr.threshold,
        );
        let agent = StructuringAgent::new(
            llm.clone(),
            config.llm.temperature,
            config.llm.max_tokens,
        );
        let chunker = Chunker::new(config.chunker.clone())?;

        let pipeline = Arc::new(Pipeline::new(
            extractors,
            analyzer,
            agent,
            chunker,
            memory.clone(),
            sessions.clone(),
            PathBuf::from(&config.server.workspace_dir),
        ));

        let chat = Arc::new(ChatService::new(
            llm,
            embedder,
            memory.clone(),
            sessions.clone(),
            cache.clone(),
            config.llm.temperature,
            config.llm.max_tokens,
        ));

        let worker = Arc::new(Worker::new(
            queue.clone(),
            pipeline.clone(),
            config.worker.clone(),
        ));

        let state = Self {
            pipeline,
            chat,
            sessions,
            memory,
            cache,
            queue,
            config: Arc::new(config),
        };
        Ok((state, worker))
    }
}

/// Request body for chat endpoints
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChatRequest {
    /// The user's question
    #[schema(example = "What was the amount on 2024-01-02?")]
    pub message: String,
    /// Session for history tracking and retrieval scoping
    #[serde(default)]
    pub session_id: Option<String>,
    /// Restrict retrieval to one document
    #[serde(default)]
    pub source_id: Option<String>,
    /// Number of context chunks to retrieve (clamped to 1-10)
    #[serde(default = "default_k")]
    #[schema(example = 4)]
    pub k: usize,
    /// Include conversation history in the prompt
    #[serde(default = "default_true")]
    pub use_history: bool,
}

fn default_k() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Response for a queued extraction task
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ExtractResponse {
    /// Always "queued" on success
    #[schema(example = "queued")]
    pub status: String,
    /// Queue task id
    pub task_id: String,
    /// Session the documents will land in
    pub session_id: String,
    /// Human-readable confirmation
    pub message: String,
}

/// A chat history entry
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChatMessageDto {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// Conversation history for a session
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChatHistoryResponse {
    pub session_id: String,
    pub history: Vec<ChatMessageDto>,
    pub message_count: usize,
}

/// Result of clearing a session's history
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ClearHistoryResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
}

/// Result of a document deletion
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct DeleteDocumentsResponse {
    pub success: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub deleted_chunks: u64,
}

/// Error response
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Health check response
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct DocumentsQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(OpenApi)]
#[openapi(components(schemas(
    ChatRequest,
    ChatResponse,
    ExtractResponse,
    ChatMessageDto,
    ChatHistoryResponse,
    ClearHistoryResponse,
    DeleteDocumentsResponse,
    ErrorResponse,
    HealthResponse,
)))]
struct ApiDoc;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(error: impl std::fmt::Display) -> ApiError {
    error!("Request failed: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
            details: Some(error.to_string()),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            details: None,
        }),
    )
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route(
            "/chat/history/{session_id}",
            get(chat_history).delete(clear_chat_history),
        )
        .route("/documents", get(documents_summary).delete(delete_documents))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown
pub async fn serve(state: AppState, bind: &str) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("API listening on {}", bind);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| crate::error::ArchiveError::Config(e.to_string()))?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "the-archive".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Queue a batch of files and links for extraction
async fn extract(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ExtractResponse>), ApiError> {
    let upload_dir = PathBuf::from(&state.config.server.upload_dir);
    std::fs::create_dir_all(&upload_dir).map_err(internal_error)?;

    let mut file_refs: Vec<FileRef> = Vec::new();
    let mut links: Vec<String> = Vec::new();
    let mut author = String::new();
    let mut use_vision = true;
    let mut session_id: Option<String> = None;
    let mut user_description: Option<String> = None;
    let mut callback_url: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(&format!("Failed to read upload: {}", e)))?;

                // Unique prefix avoids collisions between same-named uploads
                let unique = &Uuid::new_v4().simple().to_string()[..8];
                let dest = upload_dir.join(format!("{}_{}", unique, file_name));
                std::fs::write(&dest, &bytes).map_err(internal_error)?;

                file_refs.push(FileRef {
                    path: dest.display().to_string(),
                    name: file_name,
                    content_type,
                });
            }
            "links" => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    links.push(value);
                }
            }
            "author" => author = field.text().await.unwrap_or_default(),
            "use_ocr_vlm" => {
                let value = field.text().await.unwrap_or_default();
                use_vision = value.trim() != "false";
            }
            "session_id" => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    session_id = Some(value.trim().to_string());
                }
            }
            "user_description" => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    user_description = Some(value);
                }
            }
            "callback_url" => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    callback_url = Some(value.trim().to_string());
                }
            }
            other => {
                info!("Ignoring unknown multipart field: {}", other);
            }
        }
    }

    if file_refs.is_empty() && links.is_empty() {
        return Err(bad_request("Provide at least one file or link"));
    }

    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let payload = TaskPayload {
        file_refs,
        links,
        author,
        use_vision,
        session_id: session_id.clone(),
        user_description,
        callback_url,
    };

    let task_id = state.queue.enqueue(&payload).await.map_err(internal_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExtractResponse {
            status: "queued".to_string(),
            task_id,
            session_id,
            message: "Extraction task queued".to_string(),
        }),
    ))
}

/// Answer a chat message
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    let options = ChatOptions {
        session_id: request.session_id,
        source_id: request.source_id,
        k: request.k.clamp(1, 10),
        use_history: request.use_history,
        query_embedding: None,
    };

    Json(state.chat.chat(&request.message, &options).await)
}

/// Stream a chat answer as server-sent events
async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let options = ChatOptions {
        session_id: request.session_id,
        source_id: request.source_id,
        k: request.k.clamp(1, 10),
        use_history: request.use_history,
        query_embedding: None,
    };

    let receiver = state.chat.chat_stream(&request.message, &options);
    let stream = receiver
        .into_stream()
        .map(|token| Ok(Event::default().data(token)))
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Fetch a session's conversation history
async fn chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatHistoryResponse>, ApiError> {
    let messages = state
        .sessions
        .read_messages(&session_id, 10_000)
        .await
        .map_err(internal_error)?;

    let history: Vec<ChatMessageDto> = messages
        .into_iter()
        .map(|m| ChatMessageDto {
            role: m.role,
            content: m.content,
            timestamp: m.timestamp.to_rfc3339(),
        })
        .collect();

    Ok(Json(ChatHistoryResponse {
        session_id,
        message_count: history.len(),
        history,
    }))
}

/// Clear a session's conversation history
async fn clear_chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearHistoryResponse>, ApiError> {
    state
        .sessions
        .delete_chat(&session_id)
        .await
        .map_err(internal_error)?;

    Ok(Json(ClearHistoryResponse {
        success: true,
        session_id,
        message: "History cleared".to_string(),
    }))
}

/// Summarize indexed chunks, documents, and sessions
async fn documents_summary(
    State(state): State<AppState>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.memory.indexed_summary().await.map_err(internal_error)?;

    let sessions = match &query.session_id {
        Some(session_id) => state
            .sessions
            .get_session(session_id)
            .await
            .map_err(internal_error)?
            .map(|s| serde_json::json!([{
                "session_id": s.session_id,
                "author": s.author,
                "files_count": s.files_count,
                "last_updated": s.last_updated,
            }]))
            .unwrap_or_else(|| serde_json::json!([])),
        None => serde_json::to_value(
            state.sessions.list_sessions().await.map_err(internal_error)?,
        )
        .map_err(internal_error)?,
    };

    Ok(Json(serde_json::json!({
        "index": summary,
        "sessions": sessions,
    })))
}

/// Delete a document's chunks, or an entire session
async fn delete_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<DeleteDocumentsResponse>, ApiError> {
    let Some(session_id) = query.session_id.clone() else {
        return Err(bad_request("session_id is required"));
    };

    let deleted_chunks = match &query.source_id {
        Some(source_id) => {
            let filter = MetadataFilter::And(vec![
                ("session_id".to_string(), session_id.clone()),
                ("source_id".to_string(), source_id.clone()),
            ]);
            let deleted = state.memory.delete(&filter).await.map_err(internal_error)?;
            state
                .sessions
                .pull_file(&session_id, source_id)
                .await
                .map_err(internal_error)?;
            state
                .cache
                .invalidate_source(source_id)
                .await
                .map_err(internal_error)?;
            deleted
        }
        None => {
            let filter = MetadataFilter::Eq("session_id".to_string(), session_id.clone());
            let deleted = state.memory.delete(&filter).await.map_err(internal_error)?;
            state
                .sessions
                .delete_session(&session_id)
                .await
                .map_err(internal_error)?;
            deleted
        }
    };

    Ok(Json(DeleteDocumentsResponse {
        success: true,
        session_id,
        source_id: query.source_id,
        deleted_chunks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatRequest =
            serde_json::from_str("{\"message\": \"hello\"}").unwrap();
        assert_eq!(request.k, 4);
        assert!(request.use_history);
        assert!(request.session_id.is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let response = ErrorResponse {
            error: "bad".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, "{\"error\":\"bad\"}");
    }
}
