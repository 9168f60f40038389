//! Session and chat history store
//!
//! Sessions are single rows holding an append-only `files` array of
//! document records; row-level updates give the single-document
//! atomicity the ingestion flow relies on.

use crate::error::{Result, StoreError};
use crate::tables::{ChartInfo, Table};
use crate::vision::{ImageRecord, OcrMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Canonical per-document record stored in a session's `files` array.
///
/// Records are append-only once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Per-ingest unique identifier; joins a record to its chunks
    pub source_id: String,

    /// Source kind ("pdf", "excel", "url", ...)
    pub source: String,

    /// Detected primary language
    pub language: String,

    /// Uploader-provided author
    #[serde(default)]
    pub author: String,

    /// Uploader-provided description
    #[serde(default)]
    pub user_description: String,

    /// Semantic summary of the document
    pub summary: String,

    /// Number of extracted tables
    #[serde(default)]
    pub tables_count: usize,

    /// Content digest (file bytes or URL string)
    pub file_hash: String,

    /// Preprocessed text plus appended image analysis (non-tabular only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_content: Option<String>,

    /// LLM table analysis (tabular sources only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,

    /// Extracted tables (tabular sources only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<Table>>,

    /// Workbook chart metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<Vec<ChartInfo>>,

    /// Combined OCR and VLM image records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_analysis: Option<Vec<ImageRecord>>,

    /// OCR run metadata when OCR supplied the document text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_metadata: Option<OcrMetadata>,
}

/// A session with its ordered document records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub author: String,
    pub files: Vec<DocumentRecord>,
    pub files_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Summary row for session listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub author: String,
    pub files_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// A chat message with its timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// SQLite-backed session and chat history store
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Initializing session store at: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::StorageFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                author TEXT NOT NULL DEFAULT '',
                files TEXT NOT NULL DEFAULT '[]',
                files_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_session ON chat_messages(session_id, id)",
        )
        .execute(&pool)
        .await?;

        info!("Session store initialized");
        Ok(Self { pool })
    }

    // ==================== Sessions ====================

    /// Append document records to a session, creating the session on
    /// first use. `files_count` always equals the array length.
    pub async fn append_files(
        &self,
        session_id: &str,
        author: &str,
        records: &[DocumentRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT files FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;

        let mut files: Vec<DocumentRecord> = match &existing {
            Some((json,)) => serde_json::from_str(json).unwrap_or_default(),
            None => Vec::new(),
        };
        files.extend_from_slice(records);
        let files_json = serde_json::to_string(&files)?;
        let count = files.len() as i64;

        if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE sessions
                SET author = ?, files = ?, files_count = ?, last_updated = ?
                WHERE session_id = ?
                "#,
            )
            .bind(author)
            .bind(&files_json)
            .bind(count)
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO sessions (session_id, author, files, files_count, created_at, last_updated)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(author)
            .bind(&files_json)
            .bind(count)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Appended {} record(s) to session {}",
            records.len(),
            session_id
        );
        Ok(())
    }

    /// Remove a document record from a session's `files` array
    pub async fn pull_file(&self, session_id: &str, source_id: &str) -> Result<usize> {
        let session_id = session_id.trim();
        let source_id = source_id.trim();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT files FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((json,)) = existing else {
            return Err(StoreError::SessionNotFound(session_id.to_string()).into());
        };

        let mut files: Vec<DocumentRecord> = serde_json::from_str(&json).unwrap_or_default();
        let before = files.len();
        files.retain(|record| record.source_id != source_id);
        let removed = before - files.len();

        if removed > 0 {
            sqlx::query(
                r#"
                UPDATE sessions
                SET files = ?, files_count = ?, last_updated = ?
                WHERE session_id = ?
                "#,
            )
            .bind(serde_json::to_string(&files)?)
            .bind(files.len() as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        } else {
            warn!(
                "File {} not found in session {}",
                source_id, session_id
            );
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Delete an entire session row
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id.trim())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a session with its records
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let files_json: String = row.get("files");
        Ok(Some(Session {
            session_id: row.get("session_id"),
            author: row.get("author"),
            files: serde_json::from_str(&files_json).unwrap_or_default(),
            files_count: row.get("files_count"),
            created_at: parse_timestamp(&row.get::<String, _>("created_at")),
            last_updated: parse_timestamp(&row.get::<String, _>("last_updated")),
        }))
    }

    /// Find the first document record matching a content hash, across all
    /// sessions
    pub async fn find_by_file_hash(&self, file_hash: &str) -> Result<Option<DocumentRecord>> {
        let rows = sqlx::query("SELECT files FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let files_json: String = row.get("files");
            let files: Vec<DocumentRecord> =
                serde_json::from_str(&files_json).unwrap_or_default();
            if let Some(record) = files.into_iter().find(|r| r.file_hash == file_hash) {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// List all sessions
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            "SELECT session_id, author, files_count, last_updated FROM sessions ORDER BY last_updated DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SessionSummary {
                session_id: row.get("session_id"),
                author: row.get("author"),
                files_count: row.get("files_count"),
                last_updated: parse_timestamp(&row.get::<String, _>("last_updated")),
            })
            .collect())
    }

    // ==================== Chat history ====================

    /// Append a chat message in request order
    pub async fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (session_id, role, content, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read the last `limit` messages for a session, oldest first
    pub async fn read_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, timestamp FROM (
                SELECT id, role, content, timestamp FROM chat_messages
                WHERE session_id = ?
                ORDER BY id DESC
                LIMIT ?
            ) ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ChatMessage {
                role: row.get("role"),
                content: row.get("content"),
                timestamp: parse_timestamp(&row.get::<String, _>("timestamp")),
            })
            .collect())
    }

    /// Number of messages recorded for a session
    pub async fn message_count(&self, session_id: &str) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM chat_messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Delete all chat messages for a session
    pub async fn delete_chat(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn test_store() -> (SessionStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().display());
        let store = SessionStore::connect(&url).await.unwrap();
        (store, file)
    }

    fn record(source_id: &str, file_hash: &str) -> DocumentRecord {
        DocumentRecord {
            source_id: source_id.to_string(),
            source: "pdf".to_string(),
            language: "english".to_string(),
            author: "a".to_string(),
            user_description: String::new(),
            summary: "A test document".to_string(),
            tables_count: 0,
            file_hash: file_hash.to_string(),
            clean_content: None,
            analysis: None,
            tables: None,
            charts: None,
            images_analysis: None,
            ocr_metadata: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_count_invariant() {
        let (store, _file) = test_store().await;

        store
            .append_files("s1", "a", &[record("doc__1", "h1")])
            .await
            .unwrap();
        store
            .append_files("s1", "a", &[record("doc__2", "h2"), record("doc__3", "h3")])
            .await
            .unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.files_count, 3);
        assert_eq!(session.files.len() as i64, session.files_count);
        assert_eq!(session.files[0].source_id, "doc__1");
    }

    #[tokio::test]
    async fn test_pull_file_keeps_count_consistent() {
        let (store, _file) = test_store().await;

        store
            .append_files("s1", "a", &[record("doc__1", "h1"), record("doc__2", "h2")])
            .await
            .unwrap();

        let removed = store.pull_file("s1", "doc__1").await.unwrap();
        assert_eq!(removed, 1);

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.files_count, 1);
        assert_eq!(session.files[0].source_id, "doc__2");

        // Pulling a missing file is a no-op
        let removed = store.pull_file("s1", "doc__1").await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_find_by_file_hash() {
        let (store, _file) = test_store().await;

        store
            .append_files("s1", "a", &[record("doc__1", "hash-x")])
            .await
            .unwrap();
        store
            .append_files("s2", "b", &[record("doc__2", "hash-y")])
            .await
            .unwrap();

        let hit = store.find_by_file_hash("hash-y").await.unwrap().unwrap();
        assert_eq!(hit.source_id, "doc__2");
        assert!(store.find_by_file_hash("hash-z").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_session() {
        let (store, _file) = test_store().await;

        store
            .append_files("s1", "a", &[record("doc__1", "h1")])
            .await
            .unwrap();
        assert!(store.delete_session("s1").await.unwrap());
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(!store.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_chat_history_order_and_limit() {
        let (store, _file) = test_store().await;

        for i in 0..6 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            store
                .append_message("s1", role, &format!("message {}", i))
                .await
                .unwrap();
        }

        let messages = store.read_messages("s1", 4).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "message 2");
        assert_eq!(messages[3].content, "message 5");
        assert_eq!(store.message_count("s1").await.unwrap(), 6);

        let deleted = store.delete_chat("s1").await.unwrap();
        assert_eq!(deleted, 6);
        assert!(store.read_messages("s1", 10).await.unwrap().is_empty());
    }
}
