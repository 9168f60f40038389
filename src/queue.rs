//! Durable job queue and the extraction worker

use crate::config::WorkerConfig;
use crate::error::{ArchiveError, Result};
use crate::extract::IngestInput;
use crate::pipeline::{IngestOptions, IngestOutcome, Pipeline};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval while the queue is idle
const IDLE_POLL: Duration = Duration::from_secs(5);

/// A file persisted by the HTTP layer, awaiting the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub name: String,
    pub content_type: String,
}

/// Payload of one extraction task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub file_refs: Vec<FileRef>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub use_vision: bool,
    pub session_id: String,
    #[serde(default)]
    pub user_description: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// A claimed job
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: TaskPayload,
    pub attempts: i64,
}

/// Per-input status inside a task result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub filename: String,
    pub input_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fast_tracked: bool,
}

/// Aggregated result posted to the callback URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub session_id: String,
    pub batch_ref: Option<String>,
    pub processed_count: usize,
    pub documents: Vec<DocumentStatus>,
}

/// SQLite-backed FIFO queue with lease-based at-least-once delivery
pub struct JobQueue {
    pool: SqlitePool,
    queue_name: String,
    lease_seconds: i64,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl JobQueue {
    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str, queue_name: &str, lease_seconds: i64) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| ArchiveError::Queue(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                leased_until TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(queue, status, created_at)")
            .execute(&pool)
            .await?;

        let (wake_tx, wake_rx) = flume::unbounded();
        info!("Job queue '{}' ready", queue_name);

        Ok(Self {
            pool,
            queue_name: queue_name.to_string(),
            lease_seconds,
            wake_tx,
            wake_rx,
        })
    }

    /// Enqueue a task, returning its id
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs (id, queue, payload, status, created_at) VALUES (?, ?, ?, 'queued', ?)",
        )
        .bind(&id)
        .bind(&self.queue_name)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let _ = self.wake_tx.send(());
        info!("Enqueued task {} on '{}'", id, self.queue_name);
        Ok(id)
    }

    /// Claim the oldest deliverable job, if any.
    ///
    /// Jobs whose lease expired are redelivered, which gives
    /// at-least-once semantics.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, payload, attempts FROM jobs
            WHERE queue = ?
              AND (status = 'queued' OR (status = 'running' AND leased_until < ?))
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(&self.queue_name)
        .bind(now.to_rfc3339())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: String = row.get("id");
        let payload_json: String = row.get("payload");
        let attempts: i64 = row.get("attempts");

        let leased_until = (now + ChronoDuration::seconds(self.lease_seconds)).to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, leased_until = ? WHERE id = ?",
        )
        .bind(&leased_until)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let payload: TaskPayload = serde_json::from_str(&payload_json)?;
        debug!("Claimed task {} (attempt {})", id, attempts + 1);
        Ok(Some(Job {
            id,
            payload,
            attempts: attempts + 1,
        }))
    }

    /// Block until a job is available
    pub async fn wait_for_job(&self) -> Result<Job> {
        loop {
            if let Some(job) = self.dequeue().await? {
                return Ok(job);
            }
            // Wake on enqueue or fall back to polling for redeliveries
            let _ = tokio::time::timeout(IDLE_POLL, self.wake_rx.recv_async()).await;
        }
    }

    /// Mark a job done
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'done', leased_until = NULL WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job failed, recording the error
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'failed', last_error = ?, leased_until = NULL WHERE id = ?")
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a callback delivery failure on the job row
    pub async fn record_callback_error(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_error = ? WHERE id = ?")
            .bind(format!("callback failed: {}", error))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Job status by id
    pub async fn status(&self, job_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("status")))
    }
}

/// Expand and clean raw link fields.
///
/// A link that is itself a JSON array string is flattened; surrounding
/// quotes and whitespace are stripped.
pub fn normalize_links(links: &[String]) -> Vec<String> {
    let mut expanded = Vec::new();

    for link in links {
        let trimmed = link.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            match serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
                Ok(values) => {
                    for value in values {
                        if let Some(s) = value.as_str() {
                            expanded.push(s.to_string());
                        }
                    }
                    continue;
                }
                Err(_) => expanded.push(trimmed.to_string()),
            }
        } else {
            expanded.push(trimmed.to_string());
        }
    }

    expanded
        .into_iter()
        .map(|link| {
            link.trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim()
                .to_string()
        })
        .filter(|link| !link.is_empty())
        .collect()
}

/// Prefix scheme-less callback URLs with https
pub fn normalize_callback_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Worker draining the queue and driving the pipeline
pub struct Worker {
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    client: reqwest::Client,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            queue,
            pipeline,
            config,
            client,
        }
    }

    /// Drain the queue forever
    pub async fn run(self: Arc<Self>) {
        info!("Worker started (concurrency: {})", self.config.concurrency);
        loop {
            let job = match self.queue.wait_for_job().await {
                Ok(job) => job,
                Err(e) => {
                    error!("Queue error: {}", e);
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            };

            self.handle_job(job).await;
        }
    }

    /// Process one claimed job end to end, including callback and
    /// temp-file cleanup
    pub async fn handle_job(&self, job: Job) {
        let started = std::time::Instant::now();
        let session_id = job.payload.session_id.clone();
        info!(
            "Task {} started (session: {}, files: {}, links: {})",
            job.id,
            session_id,
            job.payload.file_refs.len(),
            job.payload.links.len()
        );

        let hard_limit = Duration::from_secs(self.config.hard_limit);
        let outcome =
            tokio::time::timeout(hard_limit, self.process_task(&job.payload)).await;

        let elapsed = started.elapsed();
        if elapsed.as_secs() > self.config.soft_limit {
            warn!(
                "Task {} exceeded soft time limit ({}s > {}s)",
                job.id,
                elapsed.as_secs(),
                self.config.soft_limit
            );
        }

        match outcome {
            Ok(result) => {
                self.send_callback(&job, serde_json::to_value(&result).ok()).await;
                if let Err(e) = self.queue.complete(&job.id).await {
                    error!("Failed to mark task {} done: {}", job.id, e);
                }
                info!("Task {} complete", job.id);
            }
            Err(_) => {
                error!("Task {} killed by hard time limit", job.id);
                let failure = serde_json::json!({
                    "session_id": session_id,
                    "status": "failed",
                    "error": format!("hard time limit of {}s exceeded", self.config.hard_limit),
                });
                self.send_callback(&job, Some(failure)).await;
                if let Err(e) = self.queue.fail(&job.id, "hard time limit exceeded").await {
                    error!("Failed to mark task {} failed: {}", job.id, e);
                }
            }
        }

        // Temp inputs are removed on success and failure alike
        for file_ref in &job.payload.file_refs {
            let path = PathBuf::from(&file_ref.path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Cleanup failed for {}: {}", file_ref.path, e);
                } else {
                    debug!("Deleted temp file {}", file_ref.path);
                }
            }
        }
    }

    /// Fan the task's inputs out over the pipeline with bounded
    /// concurrency; each item's error surfaces independently
    pub async fn process_task(&self, payload: &TaskPayload) -> TaskResult {
        let options = IngestOptions {
            session_id: payload.session_id.clone(),
            author: payload.author.clone(),
            user_description: payload.user_description.clone(),
            use_vision: payload.use_vision,
        };

        let mut inputs: Vec<(String, String, IngestInput)> = Vec::new();
        for file_ref in &payload.file_refs {
            inputs.push((
                file_ref.name.clone(),
                "file".to_string(),
                IngestInput::File(PathBuf::from(&file_ref.path)),
            ));
        }
        for link in normalize_links(&payload.links) {
            let input = IngestInput::from_link(&link);
            let input_type = match &input {
                IngestInput::Youtube(_) => "youtube",
                _ => "url",
            };
            inputs.push((link, input_type.to_string(), input));
        }

        let pipeline = &self.pipeline;
        let options_ref = &options;
        let results: Vec<(String, String, Result<IngestOutcome>)> =
            futures::stream::iter(inputs.into_iter().map(|(name, input_type, input)| {
                async move {
                    let outcome = pipeline.ingest(&input, options_ref).await;
                    (name, input_type, outcome)
                }
            }))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut documents = Vec::new();
        for (name, input_type, outcome) in results {
            match outcome {
                Ok(outcome) => documents.push(DocumentStatus {
                    filename: name,
                    input_type,
                    status: "success".to_string(),
                    source_id: outcome.source_id().map(str::to_string),
                    error: None,
                    fast_tracked: outcome.fast_tracked(),
                }),
                Err(e) => {
                    error!("Error processing {}: {}", name, e);
                    documents.push(DocumentStatus {
                        filename: name,
                        input_type,
                        status: "error".to_string(),
                        source_id: None,
                        error: Some(e.to_string()),
                        fast_tracked: false,
                    });
                }
            }
        }

        let processed_count = documents.iter().filter(|d| d.status == "success").count();
        TaskResult {
            session_id: payload.session_id.clone(),
            batch_ref: (processed_count > 0).then(|| payload.session_id.clone()),
            processed_count,
            documents,
        }
    }

    /// POST the result to the callback URL with the bearer token.
    ///
    /// Delivery failures are recorded on the job row; there is no retry.
    async fn send_callback(&self, job: &Job, body: Option<serde_json::Value>) {
        let url = job
            .payload
            .callback_url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| {
                (!self.config.callback_url.is_empty()).then(|| self.config.callback_url.clone())
            });

        let Some(url) = url else {
            warn!("No callback URL for task {}, skipping callback", job.id);
            return;
        };
        let Some(body) = body else {
            warn!("Unserializable result for task {}, skipping callback", job.id);
            return;
        };

        let url = normalize_callback_url(&url);
        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.config.callback_token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) => {
                info!("Callback sent for task {} (status: {})", job.id, response.status());
            }
            Err(e) => {
                error!("Callback failed for task {}: {}", job.id, e);
                if let Err(record_err) =
                    self.queue.record_callback_error(&job.id, &e.to_string()).await
                {
                    error!("Failed to record callback error: {}", record_err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn payload(session: &str) -> TaskPayload {
        TaskPayload {
            file_refs: Vec::new(),
            links: Vec::new(),
            author: "a".to_string(),
            use_vision: false,
            session_id: session.to_string(),
            user_description: None,
            callback_url: None,
        }
    }

    async fn test_queue(lease: i64) -> (JobQueue, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().display());
        let queue = JobQueue::connect(&url, "extraction_queue", lease)
            .await
            .unwrap();
        (queue, file)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, _file) = test_queue(60).await;

        let first = queue.enqueue(&payload("s1")).await.unwrap();
        let second = queue.enqueue(&payload("s2")).await.unwrap();

        let job1 = queue.dequeue().await.unwrap().unwrap();
        let job2 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job1.id, first);
        assert_eq!(job2.id, second);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_and_fail_statuses() {
        let (queue, _file) = test_queue(60).await;

        let id = queue.enqueue(&payload("s1")).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.status(&job.id).await.unwrap().unwrap(), "running");

        queue.complete(&job.id).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap().unwrap(), "done");

        let id2 = queue.enqueue(&payload("s2")).await.unwrap();
        let job2 = queue.dequeue().await.unwrap().unwrap();
        queue.fail(&job2.id, "boom").await.unwrap();
        assert_eq!(queue.status(&id2).await.unwrap().unwrap(), "failed");
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        // Lease of -1s expires immediately
        let (queue, _file) = test_queue(-1).await;

        queue.enqueue(&payload("s1")).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);

        let redelivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempts, 2);
    }

    #[test]
    fn test_normalize_links_expands_json_arrays() {
        let links = vec![
            "https://a.example".to_string(),
            "[\"https://b.example\", \"https://c.example\"]".to_string(),
            "  \"https://d.example\"  ".to_string(),
            "".to_string(),
        ];

        let normalized = normalize_links(&links);
        assert_eq!(
            normalized,
            vec![
                "https://a.example",
                "https://b.example",
                "https://c.example",
                "https://d.example",
            ]
        );
    }

    #[test]
    fn test_normalize_callback_url() {
        assert_eq!(
            normalize_callback_url("api.example.com/cb"),
            "https://api.example.com/cb"
        );
        assert_eq!(
            normalize_callback_url("http://api.example.com/cb"),
            "http://api.example.com/cb"
        );
    }
}
