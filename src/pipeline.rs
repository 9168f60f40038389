//! Ingestion orchestrator: extract, analyze, structure, persist, index

use crate::chunker::Chunker;
use crate::dedup::{FastTrack, FastTrackOutcome};
use crate::error::Result;
use crate::extract::{ExtractorSet, IngestInput, InputKind};
use crate::memory::VectorStore;
use crate::sessions::{DocumentRecord, SessionStore};
use crate::structuring::StructuringAgent;
use crate::vision::{ImageAnalyzer, OcrMetadata};
use crate::workspace::DocumentWorkspace;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Below this many characters of extracted text, OCR output is treated
/// as the document text
const THIN_TEXT_CHARS: usize = 50;

/// Options accompanying one ingest
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub session_id: String,
    pub author: String,
    pub user_description: Option<String>,
    pub use_vision: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            author: String::new(),
            user_description: None,
            use_vision: true,
        }
    }
}

/// Result of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Same-session duplicate; nothing was processed
    FastTracked { session_id: String },

    /// Cross-session duplicate; chunks and record were cloned
    Cloned {
        source_id: String,
        session_id: String,
    },

    /// Full pipeline run
    Processed {
        source_id: String,
        record_ref: String,
    },
}

impl IngestOutcome {
    /// The source id this ingest resolves to, when one exists
    pub fn source_id(&self) -> Option<&str> {
        match self {
            IngestOutcome::FastTracked { .. } => None,
            IngestOutcome::Cloned { source_id, .. } => Some(source_id),
            IngestOutcome::Processed { source_id, .. } => Some(source_id),
        }
    }

    /// Whether a short-circuit path was taken
    pub fn fast_tracked(&self) -> bool {
        !matches!(self, IngestOutcome::Processed { .. })
    }
}

/// Compute the dedup digest: SHA-256 over file bytes, MD5 over URL
/// strings
pub fn content_hash(input: &IngestInput) -> Result<String> {
    match input {
        IngestInput::File(path) => {
            let mut file = std::fs::File::open(path)?;
            let mut hasher = Sha256::new();
            let mut buffer = [0u8; 4096];
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
        IngestInput::Url(url) | IngestInput::Youtube(url) => {
            Ok(format!("{:x}", md5::compute(url.as_bytes())))
        }
    }
}

/// The end-to-end ingestion pipeline
pub struct Pipeline {
    extractors: ExtractorSet,
    analyzer: ImageAnalyzer,
    agent: StructuringAgent,
    chunker: Chunker,
    memory: Arc<VectorStore>,
    sessions: Arc<SessionStore>,
    fast_track: FastTrack,
    workspace_root: PathBuf,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractors: ExtractorSet,
        analyzer: ImageAnalyzer,
        agent: StructuringAgent,
        chunker: Chunker,
        memory: Arc<VectorStore>,
        sessions: Arc<SessionStore>,
        workspace_root: PathBuf,
    ) -> Self {
        let fast_track = FastTrack::new(memory.clone(), sessions.clone());
        Self {
            extractors,
            analyzer,
            agent,
            chunker,
            memory,
            sessions,
            fast_track,
            workspace_root,
        }
    }

    /// Run one input through the pipeline.
    ///
    /// Extraction failures abort the item; every later stage recovers
    /// locally so the record is still persisted with whatever data is
    /// available.
    pub async fn ingest(
        &self,
        input: &IngestInput,
        options: &IngestOptions,
    ) -> Result<IngestOutcome> {
        let kind = input.detect_kind()?;
        let file_hash = content_hash(input)?;
        let session_id = options.session_id.clone();

        info!(
            "Ingesting {} (kind: {}, session: {})",
            input.display_name(),
            kind,
            session_id
        );

        match self.fast_track.check(&session_id, &file_hash).await? {
            FastTrackOutcome::SameSession => {
                return Ok(IngestOutcome::FastTracked { session_id });
            }
            FastTrackOutcome::Cloned { source_id } => {
                return Ok(IngestOutcome::Cloned {
                    source_id,
                    session_id,
                });
            }
            FastTrackOutcome::Miss => {}
        }

        // Extraction aborts the item on failure
        let extraction = self.extractors.extract(input, &self.workspace_root).await?;
        let workspace = &extraction.workspace;
        let doc_id = extraction.doc_id.clone();

        // Image understanding is best-effort
        if options.use_vision && !extraction.images.is_empty() {
            let text_before = workspace.read_text();
            match self.analyzer.process(workspace, &extraction.images).await {
                Ok(records) => {
                    self.record_ocr_fallback(workspace, &text_before, &records);
                }
                Err(e) => warn!("Image analysis failed: {}", e),
            }
        }

        // Table analysis is best-effort and feeds the structuring pass
        if kind.is_tabular() {
            if let Err(e) = self.agent.analyze_tables(workspace, kind).await {
                warn!("Table analysis failed: {}", e);
            }
        }

        let record = match self
            .agent
            .structure(
                workspace,
                kind,
                &doc_id,
                &file_hash,
                &options.author,
                options.user_description.as_deref(),
            )
            .await
        {
            Ok((_, record)) => record,
            Err(e) => {
                warn!("Structuring failed, persisting minimal record: {}", e);
                DocumentRecord {
                    source_id: doc_id.clone(),
                    source: kind.as_str().to_string(),
                    language: "unknown".to_string(),
                    author: options.author.clone(),
                    user_description: options.user_description.clone().unwrap_or_default(),
                    summary: "Document processed successfully".to_string(),
                    tables_count: 0,
                    file_hash: file_hash.clone(),
                    clean_content: None,
                    analysis: None,
                    tables: None,
                    charts: None,
                    images_analysis: None,
                    ocr_metadata: None,
                }
            }
        };

        let mut record_ref = workspace.structured_path().display().to_string();
        match self
            .sessions
            .append_files(&session_id, &options.author, std::slice::from_ref(&record))
            .await
        {
            Ok(()) => record_ref = session_id.clone(),
            Err(e) => warn!("Failed to persist document record: {}", e),
        }

        if let Err(e) = self
            .index_chunks(workspace, kind, &record, &doc_id, &file_hash, options)
            .await
        {
            warn!("Indexing failed: {}", e);
        }

        workspace.cleanup();

        Ok(IngestOutcome::Processed {
            source_id: doc_id,
            record_ref,
        })
    }

    /// When the extractor produced almost no text and OCR did the heavy
    /// lifting, the OCR output replaces the content text and the OCR run
    /// metadata is persisted alongside it
    fn record_ocr_fallback(
        &self,
        workspace: &DocumentWorkspace,
        text_before: &str,
        records: &[crate::vision::ImageRecord],
    ) {
        let ocr: Vec<_> = records.iter().filter(|r| r.method == "ocr").collect();
        if text_before.trim().len() > THIN_TEXT_CHARS || ocr.is_empty() {
            return;
        }

        let replacement = ocr
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if let Err(e) = workspace.save_text(&replacement) {
            warn!("Failed to replace thin content with OCR text: {}", e);
        }

        let confidences: Vec<f32> = ocr.iter().filter_map(|r| r.confidence).collect();
        let avg = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        let metadata = OcrMetadata {
            engine: "remote".to_string(),
            confidence: avg,
            images_processed: ocr.len(),
        };
        if let Err(e) =
            workspace.save_json(&workspace.text_dir().join("ocr_metadata.json"), &metadata)
        {
            warn!("Failed to persist OCR metadata: {}", e);
        }
    }

    /// Chunk and index a freshly processed document, unless its hash is
    /// already present
    async fn index_chunks(
        &self,
        workspace: &DocumentWorkspace,
        kind: InputKind,
        record: &DocumentRecord,
        doc_id: &str,
        file_hash: &str,
        options: &IngestOptions,
    ) -> Result<()> {
        if self.memory.exists_hash(file_hash, None).await? {
            info!("Hash already indexed, skipping chunk indexing");
            return Ok(());
        }

        let tables = workspace.read_tables();
        let text = record
            .clean_content
            .clone()
            .unwrap_or_else(|| workspace.read_text());

        let mut batch = self.chunker.chunk_document(kind, &tables, &text)?;
        if batch.is_empty() {
            info!("No chunks produced for {}", doc_id);
            return Ok(());
        }

        let common: HashMap<String, String> = [
            ("source", kind.as_str().to_string()),
            ("doc_id", doc_id.to_string()),
            ("source_id", doc_id.to_string()),
            ("author", options.author.clone()),
            ("session_id", options.session_id.clone()),
            ("file_hash", file_hash.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        for metadata in batch.metadatas.iter_mut() {
            for (key, value) in &common {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let indexed = self.memory.add(&batch.texts, &batch.metadatas).await?;
        info!("Indexed {} chunks for {}", indexed, doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_url_hash_is_md5_of_string() {
        let input = IngestInput::Url("https://example.com/a".to_string());
        let hash = content_hash(&input).unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, content_hash(&input).unwrap());

        let other = IngestInput::Url("https://example.com/b".to_string());
        assert_ne!(hash, content_hash(&other).unwrap());
    }

    #[test]
    fn test_file_hash_is_sha256_of_bytes() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.csv");
        let b = tmp.path().join("b.csv");
        std::fs::write(&a, "same content").unwrap();
        std::fs::write(&b, "same content").unwrap();

        let hash_a = content_hash(&IngestInput::File(a)).unwrap();
        let hash_b = content_hash(&IngestInput::File(b)).unwrap();
        assert_eq!(hash_a.len(), 64);
        // Identical bytes hash identically regardless of file name
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn test_outcome_helpers() {
        let processed = IngestOutcome::Processed {
            source_id: "doc__1".to_string(),
            record_ref: "s1".to_string(),
        };
        assert!(!processed.fast_tracked());
        assert_eq!(processed.source_id(), Some("doc__1"));

        let fast = IngestOutcome::FastTracked {
            session_id: "s1".to_string(),
        };
        assert!(fast.fast_tracked());
        assert_eq!(fast.source_id(), None);
    }
}
