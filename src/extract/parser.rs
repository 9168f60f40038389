//! Extractor backed by the black-box document parser (pdf/word/powerpoint)

use crate::config::ParserConfig;
use crate::error::{ExtractError, Result};
use crate::extract::{
    DocumentParser, Extraction, Extractor, IngestInput, NamedImage, ParsedDocument,
};
use crate::tables::Table;
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Extractor delegating parsing to the `DocumentParser` seam.
///
/// The parser returns markdown (so these sources chunk on structure),
/// plus any tables and embedded images it recovered.
pub struct ParsedDocExtractor {
    parser: Arc<dyn DocumentParser>,
}

impl ParsedDocExtractor {
    pub fn new(parser: Arc<dyn DocumentParser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Extractor for ParsedDocExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::File(path) = input else {
            return Err(ExtractError::Unsupported("document extractor needs a file".to_string()).into());
        };
        let kind = input.detect_kind()?;

        let parsed = self.parser.parse(path).await?;
        if parsed.markdown.trim().is_empty() && parsed.tables.is_empty() {
            return Err(
                ExtractError::Empty(format!("Parser returned no content for {}", path.display()))
                    .into(),
            );
        }

        let workspace = DocumentWorkspace::create(workspace_root, &input.display_name())?;
        workspace.save_text(&parsed.markdown)?;

        if !parsed.tables.is_empty() {
            workspace.save_tables(&parsed.tables)?;
        }
        if !parsed.charts.is_empty() {
            workspace.save_charts(&parsed.charts)?;
        }

        let mut images = Vec::new();
        for image in &parsed.images {
            let dest = workspace.images_dir().join(&image.name);
            match std::fs::write(&dest, &image.bytes) {
                Ok(()) => images.push(dest),
                Err(e) => warn!("Failed to save embedded image {}: {}", image.name, e),
            }
        }

        workspace.save_metadata(&serde_json::json!({
            "source": kind.as_str(),
            "parser": "remote",
            "tables_found": parsed.tables.len(),
            "images_found": images.len(),
        }))?;

        info!(
            "Parsed {} ({} tables, {} images)",
            input.display_name(),
            parsed.tables.len(),
            images.len()
        );

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images,
            doc_id,
            kind,
        })
    }
}

/// Parser client speaking to the parsing HTTP service
pub struct HttpParserClient {
    client: reqwest::Client,
    config: ParserConfig,
}

#[derive(Debug, serde::Deserialize)]
struct ParserResponse {
    #[serde(default)]
    markdown: String,
    #[serde(default)]
    tables: Vec<Table>,
    #[serde(default)]
    charts: Vec<crate::tables::ChartInfo>,
    #[serde(default)]
    images: Vec<ParserImage>,
}

#[derive(Debug, serde::Deserialize)]
struct ParserImage {
    name: String,
    data: String,
}

impl HttpParserClient {
    pub fn new(config: ParserConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }
}

#[async_trait]
impl DocumentParser for HttpParserClient {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/parse", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExtractError::ParseFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(
                ExtractError::ParseFailed(format!("Parser HTTP {}", response.status())).into(),
            );
        }

        let parsed: ParserResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::ParseFailed(e.to_string()))?;

        let mut images = Vec::new();
        for image in parsed.images {
            match base64::engine::general_purpose::STANDARD.decode(&image.data) {
                Ok(bytes) => images.push(NamedImage {
                    name: image.name,
                    bytes,
                }),
                Err(e) => warn!("Dropping undecodable parser image {}: {}", image.name, e),
            }
        }

        Ok(ParsedDocument {
            markdown: parsed.markdown,
            tables: parsed.tables,
            charts: parsed.charts,
            images,
        })
    }
}
