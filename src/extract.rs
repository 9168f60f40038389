//! Input detection, the extractor seam, and the format registry

pub mod media;
pub mod parser;
pub mod tabular;
pub mod web;

use crate::error::{ExtractError, Result};
use crate::tables::{ChartInfo, Table};
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of a routed input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Pdf,
    Word,
    Excel,
    Csv,
    PowerPoint,
    Image,
    Media,
    Url,
    Youtube,
}

impl InputKind {
    /// Stable string form used in records and chunk metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Pdf => "pdf",
            InputKind::Word => "word",
            InputKind::Excel => "excel",
            InputKind::Csv => "csv",
            InputKind::PowerPoint => "powerpoint",
            InputKind::Image => "image",
            InputKind::Media => "media",
            InputKind::Url => "url",
            InputKind::Youtube => "youtube",
        }
    }

    /// Tabular sources chunk row by row
    pub fn is_tabular(&self) -> bool {
        matches!(self, InputKind::Excel | InputKind::Csv)
    }

    /// Sources whose extractors emit markdown chunk on structure
    pub fn is_markdown_source(&self) -> bool {
        matches!(self, InputKind::Pdf | InputKind::Word | InputKind::PowerPoint)
    }
}

impl std::fmt::Display for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a file extension (without dot, lowercase) to its input kind
pub fn kind_for_extension(ext: &str) -> Option<InputKind> {
    match ext {
        "pdf" => Some(InputKind::Pdf),
        "docx" | "doc" => Some(InputKind::Word),
        "xlsx" | "xls" | "xlsm" => Some(InputKind::Excel),
        "csv" => Some(InputKind::Csv),
        "pptx" | "ppt" => Some(InputKind::PowerPoint),
        "png" | "jpg" | "jpeg" | "bmp" | "tiff" | "webp" => Some(InputKind::Image),
        "mp4" | "avi" | "mov" | "mkv" | "webm" | "mp3" | "wav" | "m4a" | "flac" | "ogg" => {
            Some(InputKind::Media)
        }
        _ => None,
    }
}

/// YouTube link detection for routed URLs
pub fn is_youtube_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    lowered.contains("youtube.com") || lowered.contains("youtu.be")
}

/// One input routed into the pipeline
#[derive(Debug, Clone)]
pub enum IngestInput {
    File(PathBuf),
    Url(String),
    Youtube(String),
}

impl IngestInput {
    /// Build from a link, auto-detecting YouTube URLs
    pub fn from_link(link: &str) -> Self {
        if is_youtube_url(link) {
            IngestInput::Youtube(link.to_string())
        } else {
            IngestInput::Url(link.to_string())
        }
    }

    /// Determine the input kind, validating files exist and carry a
    /// supported extension
    pub fn detect_kind(&self) -> Result<InputKind> {
        match self {
            IngestInput::Youtube(_) => Ok(InputKind::Youtube),
            IngestInput::Url(_) => Ok(InputKind::Url),
            IngestInput::File(path) => {
                if !path.exists() {
                    return Err(
                        ExtractError::FileNotFound(path.display().to_string()).into()
                    );
                }
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase)
                    .unwrap_or_default();
                kind_for_extension(&ext)
                    .ok_or_else(|| ExtractError::Unsupported(format!(".{}", ext)).into())
            }
        }
    }

    /// Human-readable name for logs and workspace naming
    pub fn display_name(&self) -> String {
        match self {
            IngestInput::File(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string(),
            IngestInput::Url(url) | IngestInput::Youtube(url) => url.clone(),
        }
    }
}

/// Uniform extraction artifact handed to the downstream stages
#[derive(Debug)]
pub struct Extraction {
    pub workspace: DocumentWorkspace,
    pub images: Vec<PathBuf>,
    pub doc_id: String,
    pub kind: InputKind,
}

/// Narrow seam every format-specific extractor implements
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract the input into a fresh workspace under `workspace_root`
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction>;
}

// ==================== Collaborator seams ====================

/// A named image emitted by the document parser
#[derive(Debug, Clone)]
pub struct NamedImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Output of the black-box document parser
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub markdown: String,
    pub tables: Vec<Table>,
    pub charts: Vec<ChartInfo>,
    pub images: Vec<NamedImage>,
}

/// Black-box parser for pdf/word/powerpoint inputs
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Black-box speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media: &Path) -> Result<String>;
}

/// Black-box audio downloader for streaming platforms
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download the audio track of `url` into `dest_dir`, returning the
    /// downloaded file path
    async fn fetch_audio(&self, url: &str, dest_dir: &Path) -> Result<PathBuf>;
}

// ==================== Registry ====================

/// Registry mapping input kinds to their extractors
pub struct ExtractorSet {
    extractors: HashMap<InputKind, Arc<dyn Extractor>>,
}

impl ExtractorSet {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Register the extractor for a kind, replacing any previous one
    pub fn register(&mut self, kind: InputKind, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(kind, extractor);
    }

    /// Dispatch an input to its registered extractor
    pub async fn extract(
        &self,
        input: &IngestInput,
        workspace_root: &Path,
    ) -> Result<Extraction> {
        let kind = input.detect_kind()?;
        let extractor = self
            .extractors
            .get(&kind)
            .ok_or_else(|| ExtractError::Unsupported(kind.to_string()))?;
        extractor.extract(input, workspace_root).await
    }

    /// Build the standard registry from the collaborator seams
    pub fn standard(
        scraper_config: crate::config::ScraperConfig,
        parser: Arc<dyn DocumentParser>,
        transcriber: Arc<dyn Transcriber>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        let mut set = Self::new();

        let parsed = Arc::new(parser::ParsedDocExtractor::new(parser));
        set.register(InputKind::Pdf, parsed.clone());
        set.register(InputKind::Word, parsed.clone());
        set.register(InputKind::PowerPoint, parsed);

        set.register(InputKind::Excel, Arc::new(tabular::ExcelExtractor));
        set.register(InputKind::Csv, Arc::new(tabular::CsvExtractor));
        set.register(InputKind::Image, Arc::new(ImageExtractor));
        set.register(
            InputKind::Url,
            Arc::new(web::UrlExtractor::new(scraper_config)),
        );
        set.register(
            InputKind::Media,
            Arc::new(media::MediaExtractor::new(transcriber.clone())),
        );
        set.register(
            InputKind::Youtube,
            Arc::new(media::YoutubeExtractor::new(fetcher, transcriber)),
        );

        set
    }
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Extractor for standalone image files: the image itself is the content
pub struct ImageExtractor;

#[async_trait]
impl Extractor for ImageExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::File(path) = input else {
            return Err(ExtractError::Unsupported("image extractor needs a file".to_string()).into());
        };

        let workspace = DocumentWorkspace::create(workspace_root, &input.display_name())?;
        let dest = workspace.images_dir().join(input.display_name());
        std::fs::copy(path, &dest)?;

        workspace.save_text("")?;
        workspace.save_metadata(&serde_json::json!({
            "source": "image",
            "images_found": 1,
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images: vec![dest],
            doc_id,
            kind: InputKind::Image,
        })
    }
}
