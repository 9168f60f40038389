//! Vector store for chunk embeddings and metadata-filtered retrieval

use crate::error::{Result, StoreError};
use crate::llm::EmbeddingProvider;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Boolean filter over chunk metadata: everything, a single equality, or
/// an AND of equalities
#[derive(Debug, Clone)]
pub enum MetadataFilter {
    All,
    Eq(String, String),
    And(Vec<(String, String)>),
}

impl MetadataFilter {
    /// Build the retrieval filter from optional session and source scopes
    pub fn scoped(session_id: Option<&str>, source_id: Option<&str>) -> Self {
        match (session_id, source_id) {
            (Some(session), Some(source)) => MetadataFilter::And(vec![
                ("session_id".to_string(), session.to_string()),
                ("source_id".to_string(), source.to_string()),
            ]),
            (Some(session), None) => {
                MetadataFilter::Eq("session_id".to_string(), session.to_string())
            }
            (None, Some(source)) => {
                MetadataFilter::Eq("source_id".to_string(), source.to_string())
            }
            (None, None) => MetadataFilter::All,
        }
    }

    fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            MetadataFilter::All => Vec::new(),
            MetadataFilter::Eq(k, v) => vec![(k.as_str(), v.as_str())],
            MetadataFilter::And(pairs) => {
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
            }
        }
    }

    fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.pairs()
            .iter()
            .all(|(k, v)| metadata.get(*k).map(String::as_str) == Some(*v))
    }
}

/// A retrieved chunk with its similarity score
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub similarity: f32,
}

/// Result of an exact metadata fetch
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<HashMap<String, String>>,
}

impl ChunkSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Per-document chunk counts for the index summary
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunks {
    pub doc_id: String,
    pub source: String,
    pub session_id: String,
    pub chunks: usize,
}

/// Summary of everything currently indexed
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub total_chunks: usize,
    pub documents: Vec<DocumentChunks>,
    pub sessions: Vec<String>,
}

/// SQLite-backed embedding index with brute-force cosine search.
///
/// One instance per collection; share it behind an `Arc`. The embedding
/// client is supplied once and reused for every call.
pub struct VectorStore {
    pool: RwLock<SqlitePool>,
    database_url: String,
    collection: String,
    embedder: Arc<dyn EmbeddingProvider>,
    max_chars: usize,
}

impl VectorStore {
    /// Connect and bootstrap the schema
    pub async fn connect(
        database_url: &str,
        collection: &str,
        embedder: Arc<dyn EmbeddingProvider>,
        max_chars: usize,
    ) -> Result<Self> {
        info!(
            "Initializing vector store at {} (collection: {})",
            database_url, collection
        );

        let pool = Self::open_pool(database_url).await?;

        Ok(Self {
            pool: RwLock::new(pool),
            database_url: database_url.to_string(),
            collection: collection.to_string(),
            embedder,
            max_chars,
        })
    }

    async fn open_pool(database_url: &str) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::StorageFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                session_id TEXT NOT NULL DEFAULT 'default',
                source_id TEXT NOT NULL DEFAULT '',
                file_hash TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(collection, file_hash)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_session ON chunks(collection, session_id)",
        )
        .execute(&pool)
        .await?;

        Ok(pool)
    }

    /// Cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }

    /// Serialize embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Cap a chunk at the embedding-safe character limit
    fn truncate_chunk(&self, text: &str) -> String {
        if text.chars().count() <= self.max_chars {
            return text.to_string();
        }
        let truncated: String = text.chars().take(self.max_chars).collect();
        format!("{}...", truncated)
    }

    /// Embed and insert chunks with their metadata.
    ///
    /// Oversized chunks are truncated first; every chunk gets a
    /// `session_id` (default `"default"`).
    pub async fn add(
        &self,
        texts: &[String],
        metadatas: &[HashMap<String, String>],
    ) -> Result<usize> {
        if texts.len() != metadatas.len() {
            return Err(StoreError::StorageFailed(format!(
                "texts/metadata length mismatch: {} vs {}",
                texts.len(),
                metadatas.len()
            ))
            .into());
        }

        let mut truncated_count = 0usize;
        let safe_texts: Vec<String> = texts
            .iter()
            .map(|text| {
                let safe = self.truncate_chunk(text);
                if safe.len() != text.len() {
                    truncated_count += 1;
                }
                safe
            })
            .collect();

        if truncated_count > 0 {
            warn!(
                "Truncated {} oversized chunks to prevent embedding overflow",
                truncated_count
            );
        }

        let embeddings = self.embedder.embed_batch(&safe_texts).await?;
        let now = Utc::now().to_rfc3339();
        let pool = self.pool.read().await.clone();

        for ((text, metadata), embedding) in
            safe_texts.iter().zip(metadatas.iter()).zip(embeddings)
        {
            let mut metadata = metadata.clone();
            metadata
                .entry("session_id".to_string())
                .or_insert_with(|| "default".to_string());

            let session_id = metadata.get("session_id").cloned().unwrap_or_default();
            let source_id = metadata.get("source_id").cloned().unwrap_or_default();
            let file_hash = metadata.get("file_hash").cloned().unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, collection, content, embedding, metadata, session_id, source_id, file_hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&self.collection)
            .bind(text)
            .bind(Self::serialize_embedding(&embedding))
            .bind(serde_json::to_string(&metadata)?)
            .bind(session_id)
            .bind(source_id)
            .bind(file_hash)
            .bind(&now)
            .execute(&pool)
            .await?;
        }

        debug!("Indexed {} chunks into {}", safe_texts.len(), self.collection);
        Ok(safe_texts.len())
    }

    /// Similarity search with a metadata filter.
    ///
    /// Errors that look like a stale pool or index trigger one retry
    /// after reconnecting.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let query_embedding = self.embedder.embed(text).await?;

        match self.search(&query_embedding, k, filter).await {
            Ok(results) => Ok(results),
            Err(e) if is_stale_error(&e) => {
                warn!("Stale vector store connection, reconnecting and retrying: {}", e);
                let fresh = Self::open_pool(&self.database_url).await?;
                *self.pool.write().await = fresh;
                self.search(&query_embedding, k, filter).await
            }
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = self.fetch_rows(filter).await?;

        let mut results: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|(id, content, embedding, metadata)| {
                let similarity = Self::cosine_similarity(query_embedding, &embedding);
                ScoredChunk {
                    id,
                    content,
                    metadata,
                    similarity,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);

        debug!("Similarity search returned {} chunks", results.len());
        Ok(results)
    }

    #[allow(clippy::type_complexity)]
    async fn fetch_rows(
        &self,
        filter: &MetadataFilter,
    ) -> Result<Vec<(String, String, Vec<f32>, HashMap<String, String>)>> {
        let pool = self.pool.read().await.clone();

        // Promoted keys become SQL predicates; anything else is checked
        // against the metadata JSON after the fetch.
        let mut sql =
            String::from("SELECT id, content, embedding, metadata FROM chunks WHERE collection = ?");
        let mut binds: Vec<String> = vec![self.collection.clone()];
        for (key, value) in filter.pairs() {
            if matches!(key, "session_id" | "source_id" | "file_hash") {
                sql.push_str(&format!(" AND {} = ?", key));
                binds.push(value.to_string());
            }
        }
        sql.push_str(" ORDER BY rowid");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.get("metadata");
            let metadata: HashMap<String, String> =
                serde_json::from_str(&metadata_json).unwrap_or_default();
            if !filter.matches(&metadata) {
                continue;
            }
            let embedding_blob: Vec<u8> = row.get("embedding");
            out.push((
                row.get("id"),
                row.get("content"),
                Self::deserialize_embedding(&embedding_blob),
                metadata,
            ));
        }
        Ok(out)
    }

    /// Exact fetch by metadata filter
    pub async fn get(&self, filter: &MetadataFilter) -> Result<ChunkSet> {
        let rows = self.fetch_rows(filter).await?;

        let mut set = ChunkSet::default();
        for (id, content, _embedding, metadata) in rows {
            set.ids.push(id);
            set.documents.push(content);
            set.metadatas.push(metadata);
        }
        Ok(set)
    }

    /// Delete chunks matching the filter, returning how many went away
    pub async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        let set = self.get(filter).await?;
        if set.is_empty() {
            return Ok(0);
        }

        let pool = self.pool.read().await.clone();
        let mut deleted = 0u64;
        for id in &set.ids {
            let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&pool)
                .await?;
            deleted += result.rows_affected();
        }

        info!("Deleted {} chunks from {}", deleted, self.collection);
        Ok(deleted)
    }

    /// Drop every chunk in this collection
    pub async fn delete_collection(&self) -> Result<u64> {
        let pool = self.pool.read().await.clone();
        let result = sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(&self.collection)
            .execute(&pool)
            .await?;

        warn!(
            "Deleted collection {} ({} chunks)",
            self.collection,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Check whether a content hash is indexed, optionally scoped to one
    /// session
    pub async fn exists_hash(&self, file_hash: &str, session_id: Option<&str>) -> Result<bool> {
        let pool = self.pool.read().await.clone();

        let exists = match session_id {
            Some(session) => {
                sqlx::query(
                    "SELECT 1 FROM chunks WHERE collection = ? AND file_hash = ? AND session_id = ? LIMIT 1",
                )
                .bind(&self.collection)
                .bind(file_hash)
                .bind(session)
                .fetch_optional(&pool)
                .await?
                .is_some()
            }
            None => sqlx::query(
                "SELECT 1 FROM chunks WHERE collection = ? AND file_hash = ? LIMIT 1",
            )
            .bind(&self.collection)
            .bind(file_hash)
            .fetch_optional(&pool)
            .await?
            .is_some(),
        };

        Ok(exists)
    }

    /// Fetch the unique chunks for a content hash.
    ///
    /// When several sessions indexed the same hash, only the chunks of
    /// the first session found are returned.
    pub async fn chunks_by_hash(&self, file_hash: &str) -> Result<Option<ChunkSet>> {
        let all = self
            .get(&MetadataFilter::Eq(
                "file_hash".to_string(),
                file_hash.to_string(),
            ))
            .await?;

        if all.is_empty() {
            return Ok(None);
        }

        let first_session = all.metadatas[0]
            .get("session_id")
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let mut unique = ChunkSet::default();
        for i in 0..all.len() {
            if all.metadatas[i].get("session_id") == Some(&first_session) {
                unique.ids.push(all.ids[i].clone());
                unique.documents.push(all.documents[i].clone());
                unique.metadatas.push(all.metadatas[i].clone());
            }
        }

        debug!(
            "Found {} total chunks for hash, returning {} from session {}",
            all.len(),
            unique.len(),
            first_session
        );
        Ok(Some(unique))
    }

    /// Summarize everything indexed: chunk totals per document plus the
    /// distinct session list
    pub async fn indexed_summary(&self) -> Result<IndexSummary> {
        let all = self.get(&MetadataFilter::All).await?;

        let mut documents: HashMap<String, DocumentChunks> = HashMap::new();
        let mut sessions = BTreeSet::new();

        for metadata in &all.metadatas {
            let doc_id = metadata.get("doc_id").cloned().unwrap_or_default();
            let source = metadata
                .get("source")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let session_id = metadata
                .get("session_id")
                .cloned()
                .unwrap_or_else(|| "default".to_string());

            sessions.insert(session_id.clone());

            let entry = documents
                .entry(format!("{}:{}", source, doc_id))
                .or_insert_with(|| DocumentChunks {
                    doc_id,
                    source,
                    session_id,
                    chunks: 0,
                });
            entry.chunks += 1;
        }

        Ok(IndexSummary {
            total_chunks: all.len(),
            documents: documents.into_values().collect(),
            sessions: sessions.into_iter().collect(),
        })
    }
}

fn is_stale_error(error: &crate::error::ArchiveError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("database is locked")
        || message.contains("no such table")
        || message.contains("disk i/o error")
        || message.contains("malformed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    /// Deterministic embedder: maps text onto a tiny hashed one-hot space
    pub struct HashEmbedder;

    #[async_trait]
    impl EmbeddingProvider for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; 16];
            for token in text.to_lowercase().split_whitespace() {
                let slot = token.bytes().map(|b| b as usize).sum::<usize>() % 16;
                vector[slot] += 1.0;
            }
            Ok(vector)
        }
    }

    async fn test_store() -> (VectorStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().display());
        let store = VectorStore::connect(&url, "global_memory", Arc::new(HashEmbedder), 6000)
            .await
            .unwrap();
        (store, file)
    }

    fn meta(session: &str, source: &str, hash: &str) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("session_id".to_string(), session.to_string());
        m.insert("source_id".to_string(), source.to_string());
        m.insert("file_hash".to_string(), hash.to_string());
        m
    }

    #[tokio::test]
    async fn test_add_and_query_with_filter() {
        let (store, _file) = test_store().await;

        store
            .add(
                &[
                    "the quarterly revenue report".to_string(),
                    "a recipe for lentil soup".to_string(),
                ],
                &[meta("s1", "doc__1", "h1"), meta("s2", "doc__2", "h2")],
            )
            .await
            .unwrap();

        let results = store
            .query(
                "the quarterly revenue report",
                4,
                &MetadataFilter::Eq("session_id".to_string(), "s1".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.get("source_id").unwrap(), "doc__1");
        assert!(results[0].similarity > 0.9);
    }

    #[tokio::test]
    async fn test_default_session_applied() {
        let (store, _file) = test_store().await;

        store
            .add(&["unscoped chunk".to_string()], &[HashMap::new()])
            .await
            .unwrap();

        let set = store
            .get(&MetadataFilter::Eq(
                "session_id".to_string(),
                "default".to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_chunk_truncated() {
        let (store, _file) = test_store().await;

        let long = "x".repeat(9000);
        store
            .add(&[long], &[meta("s1", "doc__1", "h1")])
            .await
            .unwrap();

        let set = store.get(&MetadataFilter::All).await.unwrap();
        assert_eq!(set.documents[0].len(), 6003);
        assert!(set.documents[0].ends_with("..."));
    }

    #[tokio::test]
    async fn test_exists_hash_scoping() {
        let (store, _file) = test_store().await;

        store
            .add(
                &["chunk one".to_string()],
                &[meta("s1", "doc__1", "hash-a")],
            )
            .await
            .unwrap();

        assert!(store.exists_hash("hash-a", None).await.unwrap());
        assert!(store.exists_hash("hash-a", Some("s1")).await.unwrap());
        assert!(!store.exists_hash("hash-a", Some("s2")).await.unwrap());
        assert!(!store.exists_hash("hash-b", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_chunks_by_hash_first_session_only() {
        let (store, _file) = test_store().await;

        store
            .add(
                &["alpha".to_string(), "beta".to_string()],
                &[meta("s1", "doc__1", "h"), meta("s1", "doc__1", "h")],
            )
            .await
            .unwrap();
        store
            .add(&["alpha".to_string()], &[meta("s2", "doc__1", "h")])
            .await
            .unwrap();

        let unique = store.chunks_by_hash("h").await.unwrap().unwrap();
        assert_eq!(unique.len(), 2);
        for metadata in &unique.metadatas {
            assert_eq!(metadata.get("session_id").unwrap(), "s1");
        }
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let (store, _file) = test_store().await;

        store
            .add(
                &["one".to_string(), "two".to_string()],
                &[meta("s1", "doc__1", "h1"), meta("s2", "doc__2", "h2")],
            )
            .await
            .unwrap();

        let deleted = store
            .delete(&MetadataFilter::Eq(
                "session_id".to_string(),
                "s1".to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.get(&MetadataFilter::All).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.metadatas[0].get("session_id").unwrap(), "s2");
    }

    #[tokio::test]
    async fn test_indexed_summary() {
        let (store, _file) = test_store().await;

        let mut m1 = meta("s1", "doc__1", "h1");
        m1.insert("doc_id".to_string(), "doc__1".to_string());
        m1.insert("source".to_string(), "excel".to_string());
        let mut m2 = m1.clone();
        m2.insert("doc_id".to_string(), "doc__1".to_string());

        store
            .add(&["a".to_string(), "b".to_string()], &[m1, m2])
            .await
            .unwrap();

        let summary = store.indexed_summary().await.unwrap();
        assert_eq!(summary.total_chunks, 2);
        assert_eq!(summary.documents.len(), 1);
        assert_eq!(summary.documents[0].chunks, 2);
        assert_eq!(summary.sessions, vec!["s1".to_string()]);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(VectorStore::cosine_similarity(&a, &b), 1.0);
        assert_eq!(VectorStore::cosine_similarity(&a, &c), 0.0);
    }

    #[test]
    fn test_embedding_serialization() {
        let embedding = vec![1.5, -2.3, 0.0, 42.1];
        let serialized = VectorStore::serialize_embedding(&embedding);
        let deserialized = VectorStore::deserialize_embedding(&serialized);

        assert_eq!(embedding.len(), deserialized.len());
        for (orig, deser) in embedding.iter().zip(deserialized.iter()) {
            assert!((orig - deser).abs() < f32::EPSILON);
        }
    }
}
