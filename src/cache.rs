//! Query response cache with exact and semantic lookup
//!
//! Responses are keyed by a 16-hex digest of the normalized query
//! (`rag:response:<hash>[:<source_id>]`, TTL one hour). Query embeddings
//! are kept alongside (`rag:embedding:<hash>`, TTL one day) so that
//! paraphrased queries can hit the cache via cosine similarity.

use crate::config::CacheConfig;
use crate::error::{Result, StoreError};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Upper bound on embeddings compared during a semantic scan
const MAX_SEMANTIC_CANDIDATES: usize = 100;

/// A cached response hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The cached response payload
    pub value: serde_json::Value,

    /// Key the response was stored under
    pub cache_key: String,

    /// Cosine similarity for semantic hits
    pub similarity: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f32>,
    response_key: String,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub cached_responses: usize,
    pub cached_embeddings: usize,
    pub response_ttl_seconds: i64,
    pub embedding_ttl_seconds: i64,
    pub similarity_threshold: f32,
}

/// SQLite-backed response cache with TTL semantics
pub struct ResponseCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl ResponseCache {
    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str, config: CacheConfig) -> Result<Self> {
        if !config.enabled {
            info!("Response cache is disabled");
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::StorageFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expiry ON cache_entries(expires_at)")
            .execute(&pool)
            .await?;

        info!("Response cache initialized");
        Ok(Self { pool, config })
    }

    /// Digest of the normalized query: lowercase, trim, SHA-256, first
    /// 16 hex chars
    pub fn hash_query(query: &str) -> String {
        let normalized = query.to_lowercase();
        let digest = Sha256::digest(normalized.trim().as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }

    fn response_key(query_hash: &str, source_id: Option<&str>) -> String {
        match source_id {
            Some(source) => format!("rag:response:{}:{}", query_hash, source),
            None => format!("rag:response:{}", query_hash),
        }
    }

    fn embedding_key(query_hash: &str) -> String {
        format!("rag:embedding:{}", query_hash)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: String = row.get("expires_at");
        let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt < Utc::now())
            .unwrap_or(true);

        if expired {
            debug!("Cache entry expired: {}", key);
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        Ok(Some(row.get("value")))
    }

    async fn set_raw(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<()> {
        let expires_at = (Utc::now() + Duration::seconds(ttl_seconds)).to_rfc3339();
        sqlx::query(
            "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Exact match ====================

    /// Look up a cached response for an exact (normalized) query match
    pub async fn get_response(
        &self,
        query: &str,
        source_id: Option<&str>,
    ) -> Result<Option<CacheHit>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let key = Self::response_key(&Self::hash_query(query), source_id);
        match self.get_raw(&key).await? {
            Some(value) => {
                debug!("Cache HIT for key {}", key);
                Ok(Some(CacheHit {
                    value: serde_json::from_str(&value)?,
                    cache_key: key,
                    similarity: None,
                }))
            }
            None => Ok(None),
        }
    }

    /// Cache a response, optionally with the query embedding for future
    /// semantic lookups
    pub async fn put_response(
        &self,
        query: &str,
        response: &serde_json::Value,
        source_id: Option<&str>,
        query_embedding: Option<&[f32]>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let query_hash = Self::hash_query(query);
        let response_key = Self::response_key(&query_hash, source_id);

        self.set_raw(
            &response_key,
            &serde_json::to_string(response)?,
            self.config.response_ttl,
        )
        .await?;

        if let Some(embedding) = query_embedding {
            let entry = EmbeddingEntry {
                embedding: embedding.to_vec(),
                response_key: response_key.clone(),
            };
            self.set_raw(
                &Self::embedding_key(&query_hash),
                &serde_json::to_string(&entry)?,
                self.config.embedding_ttl,
            )
            .await?;
        }

        debug!("Cached response under {}", response_key);
        Ok(())
    }

    // ==================== Semantic match ====================

    /// Find a cached response for a semantically similar query.
    ///
    /// Scans up to 100 live embedding entries, takes the argmax cosine
    /// similarity, and requires it to clear the configured threshold.
    /// With a `source_id` the hit must have been cached under that same
    /// source scope.
    pub async fn semantic_lookup(
        &self,
        query_embedding: &[f32],
        source_id: Option<&str>,
    ) -> Result<Option<CacheHit>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT value, expires_at FROM cache_entries WHERE key LIKE 'rag:embedding:%' LIMIT ?",
        )
        .bind(MAX_SEMANTIC_CANDIDATES as i64)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let mut best_similarity = 0.0f32;
        let mut best_response_key: Option<String> = None;

        for row in rows {
            let expires_at: String = row.get("expires_at");
            let live = chrono::DateTime::parse_from_rfc3339(&expires_at)
                .map(|dt| dt >= now)
                .unwrap_or(false);
            if !live {
                continue;
            }

            let value: String = row.get("value");
            let Ok(entry) = serde_json::from_str::<EmbeddingEntry>(&value) else {
                continue;
            };

            let similarity = cosine_similarity(query_embedding, &entry.embedding);
            if similarity > best_similarity {
                best_similarity = similarity;
                best_response_key = Some(entry.response_key);
            }
        }

        let Some(response_key) = best_response_key else {
            return Ok(None);
        };

        if best_similarity < self.config.similarity_threshold {
            return Ok(None);
        }

        if let Some(source) = source_id {
            if !response_key.ends_with(&format!(":{}", source)) {
                return Ok(None);
            }
        }

        match self.get_raw(&response_key).await? {
            Some(value) => {
                info!("Semantic cache HIT (similarity: {:.3})", best_similarity);
                Ok(Some(CacheHit {
                    value: serde_json::from_str(&value)?,
                    cache_key: response_key,
                    similarity: Some(best_similarity),
                }))
            }
            None => Ok(None),
        }
    }

    // ==================== Management ====================

    /// Delete every cached response scoped to a source.
    ///
    /// Only keys whose suffix is exactly `:<source_id>` are removed.
    pub async fn invalidate_source(&self, source_id: &str) -> Result<u64> {
        if !self.config.enabled {
            return Ok(0);
        }

        let rows = sqlx::query("SELECT key FROM cache_entries WHERE key LIKE 'rag:response:%'")
            .fetch_all(&self.pool)
            .await?;

        let mut deleted = 0u64;
        for row in rows {
            let key: String = row.get("key");
            let parts: Vec<&str> = key.split(':').collect();
            if parts.len() == 4 && parts[3] == source_id {
                let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                    .bind(&key)
                    .execute(&self.pool)
                    .await?;
                deleted += result.rows_affected();
            }
        }

        if deleted > 0 {
            info!("Invalidated {} cached responses for source {}", deleted, source_id);
        }
        Ok(deleted)
    }

    /// Clear all cache entries
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE key LIKE 'rag:response:%' OR key LIKE 'rag:embedding:%'",
        )
        .execute(&self.pool)
        .await?;

        info!("Cleared {} cache entries", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Remove expired entries
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!("Cleaned up {} expired cache entries", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        let responses: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache_entries WHERE key LIKE 'rag:response:%'",
        )
        .fetch_one(&self.pool)
        .await?;

        let embeddings: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache_entries WHERE key LIKE 'rag:embedding:%'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            enabled: self.config.enabled,
            cached_responses: responses.0 as usize,
            cached_embeddings: embeddings.0 as usize,
            response_ttl_seconds: self.config.response_ttl,
            embedding_ttl_seconds: self.config.embedding_ttl,
            similarity_threshold: self.config.similarity_threshold,
        })
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        warn!("Embedding length mismatch in semantic lookup");
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn test_cache(config: CacheConfig) -> (ResponseCache, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", file.path().display());
        let cache = ResponseCache::connect(&url, config).await.unwrap();
        (cache, file)
    }

    #[test]
    fn test_query_hash_normalization() {
        let a = ResponseCache::hash_query("  What Is This?  ");
        let b = ResponseCache::hash_query("what is this?");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = ResponseCache::hash_query("something else");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_exact_match_round_trip() {
        let (cache, _file) = test_cache(CacheConfig::default()).await;

        let response = serde_json::json!({"answer": "42", "sources": []});
        assert!(cache
            .get_response("summary", Some("doc__1"))
            .await
            .unwrap()
            .is_none());

        cache
            .put_response("summary", &response, Some("doc__1"), None)
            .await
            .unwrap();

        let hit = cache
            .get_response("  SUMMARY ", Some("doc__1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.value["answer"], "42");

        // Different source scope misses
        assert!(cache
            .get_response("summary", Some("doc__2"))
            .await
            .unwrap()
            .is_none());
        assert!(cache.get_response("summary", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let config = CacheConfig {
            response_ttl: -1,
            ..CacheConfig::default()
        };
        let (cache, _file) = test_cache(config).await;

        cache
            .put_response("q", &serde_json::json!({"answer": "old"}), None, None)
            .await
            .unwrap();
        assert!(cache.get_response("q", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_semantic_lookup_threshold() {
        let (cache, _file) = test_cache(CacheConfig::default()).await;

        let embedding = vec![1.0, 0.0, 0.0];
        cache
            .put_response(
                "what is the archive",
                &serde_json::json!({"answer": "a platform"}),
                None,
                Some(&embedding),
            )
            .await
            .unwrap();

        // Near-identical embedding clears the 0.92 threshold
        let hit = cache
            .semantic_lookup(&[0.99, 0.05, 0.0], None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.value["answer"], "a platform");
        assert!(hit.similarity.unwrap() >= 0.92);

        // Orthogonal embedding misses
        assert!(cache
            .semantic_lookup(&[0.0, 1.0, 0.0], None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_semantic_lookup_respects_source_scope() {
        let (cache, _file) = test_cache(CacheConfig::default()).await;

        let embedding = vec![1.0, 0.0];
        cache
            .put_response(
                "question",
                &serde_json::json!({"answer": "scoped"}),
                Some("doc__1"),
                Some(&embedding),
            )
            .await
            .unwrap();

        assert!(cache
            .semantic_lookup(&embedding, Some("doc__1"))
            .await
            .unwrap()
            .is_some());
        assert!(cache
            .semantic_lookup(&embedding, Some("doc__2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate_source_is_exact() {
        let (cache, _file) = test_cache(CacheConfig::default()).await;

        cache
            .put_response("q1", &serde_json::json!({"a": 1}), Some("doc__1"), None)
            .await
            .unwrap();
        cache
            .put_response("q2", &serde_json::json!({"a": 2}), Some("doc__11"), None)
            .await
            .unwrap();
        cache
            .put_response("q3", &serde_json::json!({"a": 3}), None, None)
            .await
            .unwrap();

        let deleted = cache.invalidate_source("doc__1").await.unwrap();
        assert_eq!(deleted, 1);

        assert!(cache
            .get_response("q1", Some("doc__1"))
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get_response("q2", Some("doc__11"))
            .await
            .unwrap()
            .is_some());
        assert!(cache.get_response("q3", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let (cache, _file) = test_cache(config).await;

        cache
            .put_response("q", &serde_json::json!({"a": 1}), None, None)
            .await
            .unwrap();
        assert!(cache.get_response("q", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _file) = test_cache(CacheConfig::default()).await;

        cache
            .put_response("q", &serde_json::json!({"a": 1}), None, Some(&[0.5, 0.5]))
            .await
            .unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.cached_responses, 1);
        assert_eq!(stats.cached_embeddings, 1);
        assert_eq!(stats.response_ttl_seconds, 3600);
        assert_eq!(stats.embedding_ttl_seconds, 86400);
    }
}
