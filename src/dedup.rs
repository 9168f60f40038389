//! Content-hash deduplication and cross-session fast-tracking

use crate::error::Result;
use crate::memory::VectorStore;
use crate::sessions::SessionStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of the fast-track check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastTrackOutcome {
    /// The hash is already indexed in this session; nothing to do
    SameSession,

    /// The hash was indexed by another session; chunks and record were
    /// cloned into this one. Carries the original ingest's source id.
    Cloned { source_id: String },

    /// Unseen content; run the full pipeline
    Miss,
}

/// Fast-track engine over the vector and session stores
pub struct FastTrack {
    memory: Arc<VectorStore>,
    sessions: Arc<SessionStore>,
}

impl FastTrack {
    pub fn new(memory: Arc<VectorStore>, sessions: Arc<SessionStore>) -> Self {
        Self { memory, sessions }
    }

    /// Decide whether an input can skip the pipeline.
    ///
    /// Same-session duplicates short-circuit immediately. Global
    /// duplicates clone the chunks of the first-indexing session (with
    /// `session_id` rewritten) plus the stored document record, then
    /// short-circuit with the original `source_id`.
    pub async fn check(&self, session_id: &str, file_hash: &str) -> Result<FastTrackOutcome> {
        if self.exists(file_hash, Some(session_id)).await {
            info!(
                "File already indexed in session {}, skipping",
                session_id
            );
            return Ok(FastTrackOutcome::SameSession);
        }

        if !self.exists(file_hash, None).await {
            return Ok(FastTrackOutcome::Miss);
        }

        info!(
            "File exists globally, fast-tracking indexing for session {}",
            session_id
        );

        let Some(chunks) = self.memory.chunks_by_hash(file_hash).await? else {
            return Ok(FastTrackOutcome::Miss);
        };
        if chunks.is_empty() {
            return Ok(FastTrackOutcome::Miss);
        }

        let original_source_id = chunks.metadatas[0]
            .get("source_id")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let new_metadatas: Vec<_> = chunks
            .metadatas
            .iter()
            .map(|metadata| {
                let mut cloned = metadata.clone();
                cloned.insert("session_id".to_string(), session_id.to_string());
                cloned
            })
            .collect();

        let copied = self.memory.add(&chunks.documents, &new_metadatas).await?;
        info!("Instant indexing complete (copied {} chunks)", copied);

        match self.sessions.find_by_file_hash(file_hash).await? {
            Some(record) => {
                let author = record.author.clone();
                self.sessions
                    .append_files(session_id, &author, &[record])
                    .await?;
                info!("Cloned document record into session {}", session_id);
            }
            None => {
                warn!("No stored document record found for cloned hash");
            }
        }

        Ok(FastTrackOutcome::Cloned {
            source_id: original_source_id,
        })
    }

    /// Existence probe; store errors degrade to "not found"
    async fn exists(&self, file_hash: &str, session_id: Option<&str>) -> bool {
        match self.memory.exists_hash(file_hash, session_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Hash existence check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::EmbeddingProvider;
    use crate::memory::MetadataFilter;
    use crate::sessions::DocumentRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    async fn fixtures() -> (Arc<VectorStore>, Arc<SessionStore>, FastTrack, Vec<NamedTempFile>) {
        let vec_file = NamedTempFile::new().unwrap();
        let sess_file = NamedTempFile::new().unwrap();
        let memory = Arc::new(
            VectorStore::connect(
                &format!("sqlite:{}", vec_file.path().display()),
                "global_memory",
                Arc::new(UnitEmbedder),
                6000,
            )
            .await
            .unwrap(),
        );
        let sessions = Arc::new(
            SessionStore::connect(&format!("sqlite:{}", sess_file.path().display()))
                .await
                .unwrap(),
        );
        let fast_track = FastTrack::new(memory.clone(), sessions.clone());
        (memory, sessions, fast_track, vec![vec_file, sess_file])
    }

    fn meta(session: &str, source: &str, hash: &str) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("session_id".to_string(), session.to_string());
        m.insert("source_id".to_string(), source.to_string());
        m.insert("file_hash".to_string(), hash.to_string());
        m
    }

    fn record(source_id: &str, hash: &str) -> DocumentRecord {
        DocumentRecord {
            source_id: source_id.to_string(),
            source: "pdf".to_string(),
            language: "english".to_string(),
            author: "a".to_string(),
            user_description: String::new(),
            summary: "summary".to_string(),
            tables_count: 0,
            file_hash: hash.to_string(),
            clean_content: None,
            analysis: None,
            tables: None,
            charts: None,
            images_analysis: None,
            ocr_metadata: None,
        }
    }

    #[tokio::test]
    async fn test_miss_for_unknown_hash() {
        let (_memory, _sessions, fast_track, _files) = fixtures().await;
        assert_eq!(
            fast_track.check("s1", "nope").await.unwrap(),
            FastTrackOutcome::Miss
        );
    }

    #[tokio::test]
    async fn test_same_session_duplicate() {
        let (memory, _sessions, fast_track, _files) = fixtures().await;

        memory
            .add(&["chunk".to_string()], &[meta("s1", "doc__1", "h")])
            .await
            .unwrap();

        assert_eq!(
            fast_track.check("s1", "h").await.unwrap(),
            FastTrackOutcome::SameSession
        );

        // No extra chunks were created
        let set = memory.get(&MetadataFilter::All).await.unwrap();
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_cross_session_clone() {
        let (memory, sessions, fast_track, _files) = fixtures().await;

        memory
            .add(
                &["chunk a".to_string(), "chunk b".to_string()],
                &[meta("s1", "doc__1", "h"), meta("s1", "doc__1", "h")],
            )
            .await
            .unwrap();
        sessions
            .append_files("s1", "a", &[record("doc__1", "h")])
            .await
            .unwrap();

        let outcome = fast_track.check("s2", "h").await.unwrap();
        assert_eq!(
            outcome,
            FastTrackOutcome::Cloned {
                source_id: "doc__1".to_string()
            }
        );

        // Chunks cloned into s2 equal s1's count, session rewritten
        let cloned = memory
            .get(&MetadataFilter::Eq("session_id".to_string(), "s2".to_string()))
            .await
            .unwrap();
        assert_eq!(cloned.len(), 2);
        for metadata in &cloned.metadatas {
            assert_eq!(metadata.get("source_id").unwrap(), "doc__1");
        }

        // Record cloned into s2
        let session = sessions.get_session("s2").await.unwrap().unwrap();
        assert_eq!(session.files_count, 1);
        assert_eq!(session.files[0].source_id, "doc__1");
    }

    #[tokio::test]
    async fn test_clone_copies_first_session_only() {
        let (memory, sessions, fast_track, _files) = fixtures().await;

        // s1 indexed two chunks, s2 cloned them; s3 must still get two,
        // not four
        memory
            .add(
                &["chunk a".to_string(), "chunk b".to_string()],
                &[meta("s1", "doc__1", "h"), meta("s1", "doc__1", "h")],
            )
            .await
            .unwrap();
        sessions
            .append_files("s1", "a", &[record("doc__1", "h")])
            .await
            .unwrap();

        fast_track.check("s2", "h").await.unwrap();
        fast_track.check("s3", "h").await.unwrap();

        let s3 = memory
            .get(&MetadataFilter::Eq("session_id".to_string(), "s3".to_string()))
            .await
            .unwrap();
        assert_eq!(s3.len(), 2);
    }
}
