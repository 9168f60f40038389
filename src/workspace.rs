//! Per-document artifact workspace

use crate::error::Result;
use crate::tables::{ChartInfo, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scoped artifact directory for a single document.
///
/// Layout:
/// `text/content.txt`, `images/` (with `ocr_processed/` and
/// `vlm_processed/`), `tables/tables.json`, `charts/charts.json`,
/// `parsed/structured.json`, `audio/`, `metadata.json`.
/// Writes are idempotent; the orchestrator owns the directory until
/// cleanup.
#[derive(Debug, Clone)]
pub struct DocumentWorkspace {
    doc_id: String,
    root: PathBuf,
}

impl DocumentWorkspace {
    /// Create a fresh workspace under `workspace_root`.
    ///
    /// The document id is the input's file stem plus an 8-hex suffix, so
    /// repeated ingests of the same name never collide.
    pub fn create(workspace_root: &Path, input_name: &str) -> Result<Self> {
        let stem = Path::new(input_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        let short_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let doc_id = format!("{}__{}", stem, short_id);

        let root = workspace_root.join(&doc_id);
        for sub in [
            "text",
            "images",
            "images/ocr_processed",
            "images/vlm_processed",
            "tables",
            "charts",
            "parsed",
            "audio",
        ] {
            fs::create_dir_all(root.join(sub))?;
        }

        debug!("Created workspace {}", root.display());
        Ok(Self { doc_id, root })
    }

    /// Document identifier (`<stem>__<8hex>`)
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Workspace root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn text_dir(&self) -> PathBuf {
        self.root.join("text")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("tables")
    }

    pub fn charts_dir(&self) -> PathBuf {
        self.root.join("charts")
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.root.join("parsed")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    /// Path of the extracted text artifact
    pub fn content_path(&self) -> PathBuf {
        self.text_dir().join("content.txt")
    }

    /// Path of the structured output artifact
    pub fn structured_path(&self) -> PathBuf {
        self.parsed_dir().join("structured.json")
    }

    /// Write the extracted text, trimming trailing whitespace
    pub fn save_text(&self, text: &str) -> Result<()> {
        fs::write(self.content_path(), text.trim())?;
        Ok(())
    }

    /// Read the extracted text; missing file reads as empty
    pub fn read_text(&self) -> String {
        fs::read_to_string(self.content_path()).unwrap_or_default()
    }

    /// Append a block to the extracted text
    pub fn append_text(&self, block: &str) -> Result<()> {
        let mut text = self.read_text();
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(block.trim_end());
        fs::write(self.content_path(), text)?;
        Ok(())
    }

    /// Persist extracted tables
    pub fn save_tables(&self, tables: &[Table]) -> Result<()> {
        self.save_json(&self.tables_dir().join("tables.json"), &tables)
    }

    /// Read extracted tables; missing file reads as empty
    pub fn read_tables(&self) -> Vec<Table> {
        self.read_json(&self.tables_dir().join("tables.json"))
            .unwrap_or_default()
    }

    /// Persist workbook chart metadata
    pub fn save_charts(&self, charts: &[ChartInfo]) -> Result<()> {
        self.save_json(&self.charts_dir().join("charts.json"), &charts)
    }

    /// Read workbook chart metadata; missing file reads as empty
    pub fn read_charts(&self) -> Vec<ChartInfo> {
        self.read_json(&self.charts_dir().join("charts.json"))
            .unwrap_or_default()
    }

    /// Persist document-level metadata
    pub fn save_metadata(&self, metadata: &serde_json::Value) -> Result<()> {
        self.save_json(&self.root.join("metadata.json"), metadata)
    }

    /// Write a JSON artifact at `path`
    pub fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Read a JSON artifact at `path`, if present and well-formed
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the workspace directory and everything under it
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!("Failed to clean up workspace {}: {}", self.root.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_layout() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "report.pdf").unwrap();

        assert!(ws.doc_id().starts_with("report__"));
        assert_eq!(ws.doc_id().len(), "report__".len() + 8);
        assert!(ws.text_dir().is_dir());
        assert!(ws.images_dir().join("ocr_processed").is_dir());
        assert!(ws.images_dir().join("vlm_processed").is_dir());
        assert!(ws.tables_dir().is_dir());
        assert!(ws.parsed_dir().is_dir());
    }

    #[test]
    fn test_text_round_trip_and_append() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "notes.txt").unwrap();

        ws.save_text("hello\n").unwrap();
        assert_eq!(ws.read_text(), "hello");

        ws.append_text("[Image Text (a.png): world]").unwrap();
        let text = ws.read_text();
        assert!(text.starts_with("hello"));
        assert!(text.ends_with("[Image Text (a.png): world]"));
    }

    #[test]
    fn test_tables_round_trip() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "data.xlsx").unwrap();

        let table = Table {
            sheet: Some("Sales".to_string()),
            rows: 1,
            columns: 2,
            headers: vec!["date".to_string(), "amount".to_string()],
            data: vec![vec!["2024-01-01".to_string(), "100".to_string()]],
            ..Table::default()
        };
        ws.save_tables(std::slice::from_ref(&table)).unwrap();

        let read = ws.read_tables();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].sheet.as_deref(), Some("Sales"));
        assert_eq!(read[0].data[0][1], "100");
    }

    #[test]
    fn test_cleanup_removes_root() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "gone.csv").unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        ws.cleanup();
        assert!(!root.exists());
    }
}
