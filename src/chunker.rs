//! Strategy-dispatched chunking for vector indexing
//!
//! Tabular sources chunk row by row (plus one workbook summary chunk),
//! markdown-producing sources split on heading structure, and everything
//! else falls back to token windows.

use crate::config::ChunkerConfig;
use crate::error::Result;
use crate::extract::InputKind;
use crate::tables::Table;
use std::collections::HashMap;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

/// Maximum length of a sanitized metadata key
const MAX_METADATA_KEY_LEN: usize = 50;

/// Parallel chunk texts and their per-chunk metadata
#[derive(Debug, Default)]
pub struct ChunkBatch {
    pub texts: Vec<String>,
    pub metadatas: Vec<HashMap<String, String>>,
}

impl ChunkBatch {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    fn push(&mut self, text: String, metadata: HashMap<String, String>) {
        self.texts.push(text);
        self.metadatas.push(metadata);
    }
}

/// Strategy-dispatched chunker
pub struct Chunker {
    bpe: CoreBPE,
    config: ChunkerConfig,
}

impl Chunker {
    /// Build a chunker; loads the token encoder once
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        let bpe = cl100k_base()?;
        Ok(Self { bpe, config })
    }

    /// Chunk a document according to its source kind.
    ///
    /// The returned metadata carries chunk-specific keys (including
    /// `chunk_type`); the orchestrator merges in the common document
    /// metadata afterwards.
    pub fn chunk_document(
        &self,
        kind: InputKind,
        tables: &[Table],
        text: &str,
    ) -> Result<ChunkBatch> {
        if kind.is_tabular() {
            let mut batch = self.row_chunks(tables);
            if let Some(summary) = Self::workbook_summary(tables) {
                let mut metadata = HashMap::new();
                metadata.insert("chunk_type".to_string(), "excel_summary".to_string());
                batch.push(summary, metadata);
            }
            return Ok(batch);
        }

        if text.trim().is_empty() {
            return Ok(ChunkBatch::default());
        }

        let batch = if kind.is_markdown_source() {
            debug!("Using structure-aware chunking");
            self.structure_chunks(text)?
        } else {
            debug!("Using token chunking");
            let mut batch = ChunkBatch::default();
            for chunk in self.token_chunks(text)? {
                let mut metadata = HashMap::new();
                metadata.insert("chunk_type".to_string(), "token".to_string());
                batch.push(chunk, metadata);
            }
            batch
        };

        Ok(batch)
    }

    /// One chunk per data row: `[<sheet> - Row <n>] hdr: val, ...`
    ///
    /// Row numbers start at 2 because row 1 is the header row. Empty
    /// cells are omitted from both text and metadata.
    pub fn row_chunks(&self, tables: &[Table]) -> ChunkBatch {
        let mut batch = ChunkBatch::default();

        for table in tables {
            if table.headers.is_empty() || table.data.is_empty() {
                continue;
            }
            let sheet = table.display_name();

            for (row_idx, row) in table.data.iter().enumerate() {
                let row_number = row_idx + 2;
                let mut parts = Vec::new();
                let mut metadata = HashMap::new();
                metadata.insert("sheet".to_string(), sheet.clone());
                metadata.insert("row_number".to_string(), row_number.to_string());
                metadata.insert("chunk_type".to_string(), "excel_row".to_string());

                for (col_idx, header) in table.headers.iter().enumerate() {
                    let Some(value) = row.get(col_idx) else {
                        continue;
                    };
                    if value.trim().is_empty() {
                        continue;
                    }
                    parts.push(format!("{}: {}", header, value));
                    metadata.insert(sanitize_metadata_key(header), value.trim().to_string());
                }

                if !parts.is_empty() {
                    batch.push(
                        format!("[{} - Row {}] {}", sheet, row_number, parts.join(", ")),
                        metadata,
                    );
                }
            }
        }

        batch
    }

    /// One high-level summary chunk per workbook
    pub fn workbook_summary(tables: &[Table]) -> Option<String> {
        let lines: Vec<String> = tables
            .iter()
            .filter(|table| !table.headers.is_empty())
            .map(|table| {
                format!(
                    "Sheet '{}' contains {} rows with columns: {}",
                    table.display_name(),
                    table.rows,
                    table.headers.join(", ")
                )
            })
            .collect();

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Token-window chunking with overlap
    pub fn token_chunks(&self, text: &str) -> Result<Vec<String>> {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.config.token_size;
        let step = size.saturating_sub(self.config.token_overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < tokens.len() {
            let end = (start + size).min(tokens.len());
            let piece = self.bpe.decode(tokens[start..end].to_vec())?;
            if !piece.trim().is_empty() {
                chunks.push(piece);
            }
            if end == tokens.len() {
                break;
            }
            start += step;
        }

        Ok(chunks)
    }

    /// Markdown-aware chunking: sections split on headings, each chunk
    /// carrying its heading path
    pub fn structure_chunks(&self, markdown: &str) -> Result<ChunkBatch> {
        let mut batch = ChunkBatch::default();
        let mut heading_stack: Vec<(usize, String)> = Vec::new();
        let mut current = String::new();
        let mut current_path = String::new();

        let flush =
            |batch: &mut ChunkBatch, chunker: &Chunker, section: &str, path: &str| -> Result<()> {
                let section = section.trim();
                if section.is_empty() {
                    return Ok(());
                }
                // Oversized sections fall back to token windows under the
                // same heading path
                for piece in chunker.token_chunks(section)? {
                    let mut metadata = HashMap::new();
                    metadata.insert("chunk_type".to_string(), "structure".to_string());
                    if !path.is_empty() {
                        metadata.insert("heading_path".to_string(), path.to_string());
                    }
                    batch.push(piece, metadata);
                }
                Ok(())
            };

        for line in markdown.lines() {
            let trimmed = line.trim_start();
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            let is_heading =
                level >= 1 && level <= 6 && trimmed.chars().nth(level) == Some(' ');

            if is_heading {
                flush(&mut batch, self, &current, &current_path)?;
                current = String::new();

                let title = trimmed[level..].trim().to_string();
                heading_stack.retain(|(l, _)| *l < level);
                heading_stack.push((level, title));
                current_path = heading_stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" > ");
            }

            current.push_str(line);
            current.push('\n');
        }

        flush(&mut batch, self, &current, &current_path)?;
        Ok(batch)
    }
}

/// Sanitize a table header into a metadata key: lowercase, spaces and
/// hyphens to underscores, alphanumerics and underscores only, capped at
/// 50 chars
pub fn sanitize_metadata_key(header: &str) -> String {
    header
        .to_lowercase()
        .replace([' ', '-'], "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(MAX_METADATA_KEY_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(sheet: &str, headers: &[&str], rows: &[&[&str]]) -> Table {
        Table {
            sheet: Some(sheet.to_string()),
            rows: rows.len(),
            columns: headers.len(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            data: rows
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
            ..Table::default()
        }
    }

    fn chunker() -> Chunker {
        Chunker::new(ChunkerConfig::default()).unwrap()
    }

    #[test]
    fn test_sanitize_metadata_key() {
        assert_eq!(sanitize_metadata_key("First Name"), "first_name");
        assert_eq!(sanitize_metadata_key("Amount ($)"), "amount_");
        assert_eq!(sanitize_metadata_key("a-b c"), "a_b_c");
        assert_eq!(sanitize_metadata_key(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn test_row_chunks_format_and_metadata() {
        let tables = vec![table(
            "Sales",
            &["date", "amount"],
            &[&["2024-01-01", "100"], &["2024-01-02", "200"]],
        )];

        let batch = chunker().row_chunks(&tables);
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.texts[0],
            "[Sales - Row 2] date: 2024-01-01, amount: 100"
        );
        assert_eq!(
            batch.texts[1],
            "[Sales - Row 3] date: 2024-01-02, amount: 200"
        );
        assert_eq!(batch.metadatas[0].get("date").unwrap(), "2024-01-01");
        assert_eq!(batch.metadatas[0].get("amount").unwrap(), "100");
        assert_eq!(batch.metadatas[0].get("row_number").unwrap(), "2");
        assert_eq!(batch.metadatas[0].get("chunk_type").unwrap(), "excel_row");
    }

    #[test]
    fn test_row_chunks_omit_empty_cells() {
        let tables = vec![table("S", &["a", "b"], &[&["1", ""]])];
        let batch = chunker().row_chunks(&tables);
        assert_eq!(batch.texts[0], "[S - Row 2] a: 1");
        assert!(!batch.metadatas[0].contains_key("b"));
    }

    #[test]
    fn test_workbook_summary() {
        let tables = vec![
            table("Sales", &["date", "amount"], &[&["x", "y"]]),
            table("Meta", &["key", "value"], &[&["owner", "alice"]]),
        ];

        let summary = Chunker::workbook_summary(&tables).unwrap();
        assert!(summary.contains("Sheet 'Sales' contains 1 rows with columns: date, amount"));
        assert!(summary.contains("Sheet 'Meta' contains 1 rows with columns: key, value"));
    }

    #[test]
    fn test_tabular_dispatch_appends_summary() {
        let tables = vec![table(
            "Sales",
            &["date", "amount"],
            &[&["2024-01-01", "100"]],
        )];

        let batch = chunker()
            .chunk_document(InputKind::Excel, &tables, "")
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.metadatas.last().unwrap().get("chunk_type").unwrap(),
            "excel_summary"
        );
    }

    #[test]
    fn test_token_chunks_exact_reconstruction_without_overlap() {
        let config = ChunkerConfig {
            token_size: 8,
            token_overlap: 0,
            max_chars: 6000,
        };
        let chunker = Chunker::new(config).unwrap();

        let text = "The quick brown fox jumps over the lazy dog. \
                    Pack my box with five dozen liquor jugs. \
                    How vexingly quick daft zebras jump.";
        let chunks = chunker.token_chunks(text).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_token_chunks_overlap_repeats_tokens() {
        let config = ChunkerConfig {
            token_size: 8,
            token_overlap: 4,
            max_chars: 6000,
        };
        let chunker = Chunker::new(config).unwrap();

        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = chunker.token_chunks(text).unwrap();
        assert!(chunks.len() > 1);
        // The tail of each chunk reappears at the head of the next
        assert!(chunks[0].ends_with("five six seven eight"));
        assert!(chunks[1].trim_start().starts_with("five six seven eight"));
    }

    #[test]
    fn test_structure_chunks_heading_paths() {
        let markdown = "# Guide\nIntro text.\n\n## Setup\nInstall steps.\n\n## Usage\nRun it.";
        let batch = chunker().structure_chunks(markdown).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.metadatas[0].get("heading_path").unwrap(), "Guide");
        assert_eq!(
            batch.metadatas[1].get("heading_path").unwrap(),
            "Guide > Setup"
        );
        assert_eq!(
            batch.metadatas[2].get("heading_path").unwrap(),
            "Guide > Usage"
        );
        assert!(batch.texts[1].contains("Install steps."));
        for metadata in &batch.metadatas {
            assert_eq!(metadata.get("chunk_type").unwrap(), "structure");
        }
    }

    #[test]
    fn test_empty_text_produces_no_chunks() {
        let batch = chunker()
            .chunk_document(InputKind::Url, &[], "   ")
            .unwrap();
        assert!(batch.is_empty());
    }
}
