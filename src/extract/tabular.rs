//! Workbook and CSV extractors

use crate::error::{ExtractError, Result};
use crate::extract::{Extraction, Extractor, IngestInput, InputKind};
use crate::tables::{detect_numeric_columns, format_table_as_markdown, preprocess_table, Table};
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use calamine::{open_workbook_auto, Reader};
use std::path::Path;
use tracing::{debug, info};

/// Extractor for .xlsx/.xls/.xlsm workbooks
pub struct ExcelExtractor;

#[async_trait]
impl Extractor for ExcelExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::File(path) = input else {
            return Err(ExtractError::Unsupported("excel extractor needs a file".to_string()).into());
        };

        let workspace = DocumentWorkspace::create(workspace_root, &input.display_name())?;

        let mut workbook = open_workbook_auto(path)
            .map_err(|e| ExtractError::ParseFailed(format!("Failed to open workbook: {}", e)))?;

        let sheet_names = workbook.sheet_names().to_owned();
        let mut text = format!(
            "EXCEL WORKBOOK: {}\nTotal Sheets: {}\n\n",
            input.display_name(),
            sheet_names.len()
        );

        let mut tables = Vec::new();
        for (sheet_idx, sheet_name) in sheet_names.iter().enumerate() {
            let Ok(range) = workbook.worksheet_range(sheet_name) else {
                continue;
            };

            text.push_str(&format!(
                "{}\nSHEET {}: {}\n{}\n\n",
                "=".repeat(60),
                sheet_idx + 1,
                sheet_name,
                "=".repeat(60)
            ));

            let grid: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                .collect();

            if grid.is_empty() {
                text.push_str("[Empty Sheet]\n");
                continue;
            }

            let Some(mut table) = preprocess_table(grid) else {
                text.push_str("[Empty Sheet]\n");
                continue;
            };
            table.sheet = Some(sheet_name.clone());
            table.sheet_index = Some(sheet_idx as u32 + 1);

            text.push_str(&format!(
                "[TABLE: {}]\nDimensions: {} rows x {} columns\n\n",
                sheet_name,
                table.rows + 1,
                table.columns
            ));
            text.push_str(&format_table_as_markdown(&table));
            text.push_str("\n\n");

            let numeric = detect_numeric_columns(&table);
            if !numeric.is_empty() {
                text.push_str(&format!(
                    "Numeric columns detected: {}\n\n",
                    numeric.join(", ")
                ));
            }

            tables.push(table);
        }

        if !tables.is_empty() {
            workspace.save_tables(&tables)?;
            info!("Found {} sheet(s) with data in workbook", tables.len());
        }

        workspace.save_text(&text)?;
        workspace.save_metadata(&serde_json::json!({
            "source": "excel",
            "sheets": sheet_names.len(),
            "tables_found": tables.len(),
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images: Vec::new(),
            doc_id,
            kind: InputKind::Excel,
        })
    }
}

/// Extractor for CSV files: one table, first row as headers
pub struct CsvExtractor;

#[async_trait]
impl Extractor for CsvExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::File(path) = input else {
            return Err(ExtractError::Unsupported("csv extractor needs a file".to_string()).into());
        };

        let workspace = DocumentWorkspace::create(workspace_root, &input.display_name())?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| ExtractError::ParseFailed(format!("Failed to open CSV: {}", e)))?;

        let mut grid: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| ExtractError::ParseFailed(format!("Bad CSV row: {}", e)))?;
            grid.push(record.iter().map(str::to_string).collect());
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("data")
            .to_string();

        let mut text = format!("CSV FILE: {}\n\n", input.display_name());
        let mut tables = Vec::new();

        if let Some(mut table) = preprocess_table(grid) {
            table.sheet = Some(stem);
            text.push_str(&format!(
                "Dimensions: {} rows x {} columns\n\n",
                table.rows, table.columns
            ));
            text.push_str(&format_table_as_markdown(&table));
            text.push('\n');

            let numeric = detect_numeric_columns(&table);
            if !numeric.is_empty() {
                text.push_str(&format!(
                    "\nNumeric columns detected: {}\n",
                    numeric.join(", ")
                ));
            }

            tables.push(table);
        } else {
            debug!("CSV {} produced no usable table", path.display());
        }

        if !tables.is_empty() {
            workspace.save_tables(&tables)?;
        }
        workspace.save_text(&text)?;
        workspace.save_metadata(&serde_json::json!({
            "source": "csv",
            "tables_found": tables.len(),
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images: Vec::new(),
            doc_id,
            kind: InputKind::Csv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_csv_extraction() {
        let tmp = TempDir::new().unwrap();
        let csv_path = tmp.path().join("sales.csv");
        std::fs::write(&csv_path, "date,amount\n2024-01-01,100\n2024-01-02,200\n").unwrap();

        let extraction = CsvExtractor
            .extract(&IngestInput::File(csv_path), tmp.path())
            .await
            .unwrap();

        assert_eq!(extraction.kind, InputKind::Csv);
        let tables = extraction.workspace.read_tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].sheet.as_deref(), Some("sales"));
        assert_eq!(tables[0].headers, vec!["date", "amount"]);
        assert_eq!(tables[0].rows, 2);

        let text = extraction.workspace.read_text();
        assert!(text.contains("CSV FILE: sales.csv"));
        assert!(text.contains("| date | amount |"));
        assert!(text.contains("Numeric columns detected: amount"));
    }

    #[tokio::test]
    async fn test_csv_with_ragged_rows() {
        let tmp = TempDir::new().unwrap();
        let csv_path = tmp.path().join("ragged.csv");
        std::fs::write(&csv_path, "a,b,c\n1,2\n,,\n4,5,6\n").unwrap();

        let extraction = CsvExtractor
            .extract(&IngestInput::File(csv_path), tmp.path())
            .await
            .unwrap();

        let tables = extraction.workspace.read_tables();
        // The all-empty row is dropped during preprocessing
        assert_eq!(tables[0].rows, 2);
    }

    #[tokio::test]
    async fn test_empty_csv_has_no_tables() {
        let tmp = TempDir::new().unwrap();
        let csv_path = tmp.path().join("empty.csv");
        std::fs::write(&csv_path, "").unwrap();

        let extraction = CsvExtractor
            .extract(&IngestInput::File(csv_path), tmp.path())
            .await
            .unwrap();

        assert!(extraction.workspace.read_tables().is_empty());
    }
}
