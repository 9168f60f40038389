//! LLM structuring: canonical document records and table analysis

use crate::error::Result;
use crate::extract::InputKind;
use crate::llm::{CompletionProvider, GenerationOptions, Message};
use crate::sessions::DocumentRecord;
use crate::tables::{ChartInfo, Table};
use crate::text::{extract_json, preprocess_text, sanitize_control_chars};
use crate::vision::{ImageRecord, OcrMetadata};
use crate::workspace::DocumentWorkspace;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Character budget for the parse prompt
const MAX_PROMPT_CHARS: usize = 3500;

/// Tables summarized in the parse prompt
const MAX_PROMPT_TABLES: usize = 3;

/// Image content excerpt length in prompts
const MAX_IMAGE_EXCERPT: usize = 300;

/// Minimum text length that counts as extractable content
const MIN_CONTENT_CHARS: usize = 10;

/// Temperature for the table analysis pass
const TABLE_ANALYSIS_TEMPERATURE: f32 = 0.3;

const PARSE_PROMPT: &str = r#"You are a professional document analyst. Analyze this document and extract key information.

IMPORTANT INSTRUCTIONS:
1. Detect the primary language (english, arabic, mixed, etc.)
2. Write a COMPREHENSIVE semantic summary that covers:
   - What is the main topic/subject of the document?
   - What are the key points, features, or capabilities discussed?
   - What is the purpose or goal of the document?
   - Any important details, metrics, or conclusions

The summary should be 2-5 sentences that capture the ESSENCE of the document.
DO NOT just copy the first paragraph. Synthesize the entire content.
DO NOT mention structural elements like "this document has X pages" or "contains Y images".

Return ONLY a valid JSON object in this exact format:
{
  "language": "detected language here",
  "summary": "Your comprehensive semantic summary here"
}

Document Content:
{TEXT}

JSON Response:"#;

#[derive(Debug, Deserialize)]
struct ParseReply {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// LLM-backed structuring agent
pub struct StructuringAgent {
    llm: Arc<dyn CompletionProvider>,
    temperature: f32,
    max_tokens: u32,
}

impl StructuringAgent {
    pub fn new(llm: Arc<dyn CompletionProvider>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            llm,
            temperature,
            max_tokens,
        }
    }

    /// Produce the canonical document record and persist it to
    /// `parsed/structured.json`.
    ///
    /// Skips the LLM entirely when there is no text, no tables, and no
    /// image analysis, emitting a default record instead.
    pub async fn structure(
        &self,
        workspace: &DocumentWorkspace,
        kind: InputKind,
        source_id: &str,
        file_hash: &str,
        author: &str,
        user_description: Option<&str>,
    ) -> Result<(PathBuf, DocumentRecord)> {
        let raw_text = workspace.read_text();
        let clean_text = sanitize_control_chars(&preprocess_text(&raw_text));

        let tables = workspace.read_tables();
        let charts = workspace.read_charts();
        let images = load_image_records(workspace);

        let text_for_llm: String = clean_text.chars().take(MAX_PROMPT_CHARS).collect();

        let has_content = text_for_llm.trim().len() > MIN_CONTENT_CHARS
            || !tables.is_empty()
            || !images.is_empty();

        if !has_content {
            warn!(
                "No content found for {}, skipping LLM call",
                source_id
            );
            let basic = match user_description {
                Some(desc) if desc.len() > 5 => desc.to_string(),
                _ => format!("Image file: {}", source_id),
            };
            let record = DocumentRecord {
                source_id: source_id.to_string(),
                source: kind.as_str().to_string(),
                language: "unknown".to_string(),
                author: author.to_string(),
                user_description: user_description.unwrap_or_default().to_string(),
                summary: format!("No extractable text found. {}", basic),
                tables_count: 0,
                file_hash: file_hash.to_string(),
                clean_content: Some(clean_text),
                analysis: None,
                tables: None,
                charts: None,
                images_analysis: None,
                ocr_metadata: None,
            };
            let path = workspace.structured_path();
            workspace.save_json(&path, &record)?;
            return Ok((path, record));
        }

        let mut prompt_text = text_for_llm;
        prompt_text.push_str(&tables_prompt_block(&tables));
        prompt_text.push_str(&images_prompt_block(&images));

        info!(
            "Calling LLM for parsing (tables: {}, images: {})",
            tables.len(),
            images.len()
        );

        let prompt = PARSE_PROMPT.replace("{TEXT}", &prompt_text);
        let reply = self
            .llm
            .generate(
                &[Message::user(prompt)],
                &GenerationOptions {
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                },
            )
            .await
            .map(|r| r.text)
            .unwrap_or_else(|e| {
                warn!("LLM parse call failed: {}", e);
                String::new()
            });

        let mut language = "unknown".to_string();
        let mut summary = default_summary(kind, &tables);

        // The image note only decorates the fallback summary; a usable
        // LLM summary below replaces it outright
        if !images.is_empty() && summary.len() < 50 {
            summary.push_str(&format!(
                " (Contains {} analyzed images/charts)",
                images.len()
            ));
        }

        match extract_json(&reply).and_then(|json| {
            serde_json::from_str::<ParseReply>(&json).map_err(Into::into)
        }) {
            Ok(parsed) => {
                if let Some(lang) = parsed.language {
                    language = lang;
                }
                if let Some(llm_summary) = parsed.summary {
                    if llm_summary.len() > 20 {
                        summary = llm_summary;
                    }
                }
            }
            Err(e) => {
                warn!("LLM parse output unusable, keeping defaults: {}", e);
            }
        }

        let is_excel = kind == InputKind::Excel;
        let clean_content = if is_excel {
            None
        } else {
            Some(append_image_analysis(clean_text, &images))
        };

        let analysis: Option<serde_json::Value> = if is_excel {
            workspace.read_json(&workspace.tables_dir().join("analysis.json"))
        } else {
            None
        };

        let ocr_metadata: Option<OcrMetadata> =
            workspace.read_json(&workspace.text_dir().join("ocr_metadata.json"));

        let record = DocumentRecord {
            source_id: source_id.to_string(),
            source: kind.as_str().to_string(),
            language,
            author: author.to_string(),
            user_description: user_description.unwrap_or_default().to_string(),
            summary,
            tables_count: tables.len(),
            file_hash: file_hash.to_string(),
            clean_content,
            analysis,
            tables: if is_excel && !tables.is_empty() {
                Some(tables)
            } else {
                None
            },
            charts: if is_excel && !charts.is_empty() {
                Some(charts)
            } else {
                None
            },
            images_analysis: if images.is_empty() {
                None
            } else {
                Some(images)
            },
            ocr_metadata,
        };

        let path = workspace.structured_path();
        workspace.save_json(&path, &record)?;
        Ok((path, record))
    }

    /// Run the table/chart analysis pass for tabular sources and persist
    /// `tables/analysis.json`
    pub async fn analyze_tables(
        &self,
        workspace: &DocumentWorkspace,
        kind: InputKind,
    ) -> Result<Option<serde_json::Value>> {
        let tables = workspace.read_tables();
        if tables.is_empty() {
            return Ok(None);
        }
        let charts = workspace.read_charts();

        let prompt = match kind {
            InputKind::Excel => excel_analysis_prompt(&tables, &charts),
            InputKind::Csv => csv_analysis_prompt(&tables),
            _ => return Ok(None),
        };

        info!("Running table analysis");
        let reply = self
            .llm
            .generate(
                &[Message::user(prompt)],
                &GenerationOptions {
                    temperature: TABLE_ANALYSIS_TEMPERATURE,
                    max_tokens: self.max_tokens,
                },
            )
            .await?;

        let json = extract_json(&reply.text)?;
        let analysis: serde_json::Value = serde_json::from_str(&json)?;

        workspace.save_json(&workspace.tables_dir().join("analysis.json"), &analysis)?;
        Ok(Some(analysis))
    }
}

fn load_image_records(workspace: &DocumentWorkspace) -> Vec<ImageRecord> {
    let mut records: Vec<ImageRecord> = workspace
        .read_json(&workspace.images_dir().join("ocr_analysis.json"))
        .unwrap_or_default();
    let vlm: Vec<ImageRecord> = workspace
        .read_json(&workspace.images_dir().join("analysis.json"))
        .unwrap_or_default();
    records.extend(vlm);
    records
}

fn tables_prompt_block(tables: &[Table]) -> String {
    if tables.is_empty() {
        return String::new();
    }

    let mut block = format!("\n\nTABLES FOUND: {}\n", tables.len());
    for (idx, table) in tables.iter().take(MAX_PROMPT_TABLES).enumerate() {
        block.push_str(&format!("\nTable {}:\n", idx + 1));
        if let Some(page) = table.page {
            block.push_str(&format!("Location: Page {}\n", page));
        } else if let Some(slide) = table.slide {
            block.push_str(&format!("Location: Slide {}\n", slide));
        } else if let Some(sheet) = &table.sheet {
            block.push_str(&format!("Sheet: {}\n", sheet));
        }
        block.push_str(&format!("Columns: {}\n", table.columns));
        block.push_str(&format!("Rows: {}\n", table.rows));
        if !table.headers.is_empty() {
            block.push_str(&format!("Headers: {}\n", table.headers.join(", ")));
        }
    }
    block
}

fn images_prompt_block(images: &[ImageRecord]) -> String {
    if images.is_empty() {
        return String::new();
    }

    let mut block = format!("\n\nANALYZED IMAGES ({}):\n", images.len());
    for record in images {
        let excerpt: String = record.content.chars().take(MAX_IMAGE_EXCERPT).collect();
        block.push_str(&format!(
            "- [{}] Image: {}\n  Content: {}...\n",
            record.method.to_uppercase(),
            record.image,
            excerpt
        ));
        if record.is_graph == Some(true) {
            block.push_str("  Type: Graph/Chart\n");
        }
    }
    block
}

/// Source-specific fallback summary used when the LLM reply is unusable
fn default_summary(kind: InputKind, tables: &[Table]) -> String {
    match kind {
        InputKind::Excel if !tables.is_empty() => {
            let total_rows: usize = tables.iter().map(|t| t.rows).sum();
            let sheet_names: Vec<String> = tables.iter().map(Table::display_name).collect();
            if tables.len() == 1 {
                format!(
                    "Excel workbook with 1 sheet ({}) containing {} rows and {} columns of data",
                    sheet_names[0], total_rows, tables[0].columns
                )
            } else {
                format!(
                    "Excel workbook with {} sheets ({}) containing {} total rows of data",
                    tables.len(),
                    sheet_names
                        .iter()
                        .take(3)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                    total_rows
                )
            }
        }
        InputKind::Csv if !tables.is_empty() => {
            let table = &tables[0];
            let mut summary = format!(
                "CSV file with {} rows and {} columns",
                table.rows, table.columns
            );
            if !table.headers.is_empty() {
                let mut preview = table
                    .headers
                    .iter()
                    .take(5)
                    .map(|h| h.chars().take(20).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(", ");
                if table.headers.len() > 5 {
                    preview.push_str("...");
                }
                summary.push_str(&format!(" (columns: {})", preview));
            }
            summary
        }
        _ => "Document processed successfully".to_string(),
    }
}

/// Append the image analysis block used for RAG indexing
fn append_image_analysis(mut clean_text: String, images: &[ImageRecord]) -> String {
    let parts: Vec<String> = images
        .iter()
        .filter(|record| !record.content.is_empty())
        .map(|record| {
            format!(
                "[{} - {}]: {}",
                record.method.to_uppercase(),
                record.image,
                record.content
            )
        })
        .collect();

    if !parts.is_empty() {
        clean_text.push_str("\n\n--- IMAGE ANALYSIS ---\n");
        clean_text.push_str(&parts.join("\n\n"));
    }
    clean_text
}

fn tables_text_block(tables: &[Table], is_excel: bool) -> String {
    let mut text = String::new();
    for (idx, table) in tables.iter().enumerate() {
        if table.headers.is_empty() && table.data.is_empty() {
            continue;
        }

        if is_excel {
            text.push_str(&format!(
                "Sheet {}: {}\nSize: {} rows x {} columns\n",
                idx + 1,
                table.display_name(),
                table.rows,
                table.columns
            ));
        } else {
            text.push_str(&format!("Table {}:\n", idx + 1));
        }

        if !table.headers.is_empty() {
            text.push_str(&format!(
                "Headers: | {} |\n",
                table
                    .headers
                    .iter()
                    .map(|h| h.chars().take(50).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(" | ")
            ));
        }

        let row_limit = if is_excel && table.data.len() > 10 {
            5
        } else {
            table.data.len().min(15)
        };
        for row in table.data.iter().take(row_limit) {
            text.push_str(&format!(
                "| {} |\n",
                row.iter()
                    .map(|c| c.chars().take(50).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(" | ")
            ));
        }
        if table.data.len() > row_limit {
            text.push_str(&format!("... ({} more rows)\n", table.data.len() - row_limit));
        }
        text.push('\n');
    }
    text
}

fn excel_analysis_prompt(tables: &[Table], charts: &[ChartInfo]) -> String {
    let mut tables_text = format!(
        "EXCEL WORKBOOK ANALYSIS:\nTotal Sheets: {}\n\n",
        tables.len()
    );
    tables_text.push_str(&tables_text_block(tables, true));

    let mut charts_text = String::new();
    if !charts.is_empty() {
        charts_text.push_str(&format!("\n\nCHARTS FOUND: {} chart(s)\n", charts.len()));
        for chart in charts {
            charts_text.push_str(&format!(
                "\nChart on Sheet '{}':\n  Type: {}\n",
                chart.sheet, chart.chart_type
            ));
            if let Some(title) = &chart.title {
                charts_text.push_str(&format!("  Title: {}\n", title));
            }
            if let Some(series) = chart.data_series {
                charts_text.push_str(&format!("  Data Series: {}\n", series));
            }
        }
    }

    let chart_field = if charts.is_empty() {
        String::new()
    } else {
        ",\n  \"chart_analysis\": [{\"chart_title\": \"title\", \"chart_type\": \"type\", \
         \"purpose\": \"what it shows\", \"key_insights\": [\"insight 1\", \"insight 2\"]}]"
            .to_string()
    };

    format!(
        r#"Analyze this Excel workbook and provide detailed insights:

1. What is the main purpose of this workbook?
2. What type of data does each sheet contain?
3. Identify key metrics, totals, or important values
4. Detect any patterns, trends, or relationships in the data
{}
{}
{}

Return your analysis as JSON:
{{
  "sheet_purposes": {{
    "SheetName": "Purpose/Description of this sheet"
  }},
  "insights": [
    "Metric: Value (e.g., Total Revenue: $500k)",
    "Pattern: Description (e.g., Sales peak on Fridays)",
    "Insight: Business implication (e.g., Growth is slowing)"
  ]{}
}}
"#,
        if charts.is_empty() {
            ""
        } else {
            "5. For each chart found, explain what it visualizes and what insights it provides"
        },
        tables_text,
        charts_text,
        chart_field
    )
}

fn csv_analysis_prompt(tables: &[Table]) -> String {
    format!(
        r#"Analyze this CSV file and provide detailed insights:

1. What type of data does this CSV contain?
2. What are the column names and what do they represent?
3. Identify key metrics, totals, or ranges in the data
4. Detect any patterns, trends, or distributions
5. What could this data be used for?

CSV FILE ANALYSIS:

{}

Return your analysis as JSON:
{{
  "data_type": "description of what data this is",
  "column_descriptions": {{"column1": "what it contains", "column2": "what it contains"}},
  "key_statistics": ["stat 1", "stat 2"],
  "patterns": ["pattern 1", "pattern 2"],
  "use_cases": ["use case 1", "use case 2"]
}}
"#,
        tables_text_block(tables, false)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::GenerationResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted LLM double counting its invocations
    struct ScriptedLlm {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(reply: Option<&str>) -> Self {
            Self {
                reply: reply.map(str::to_string),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedLlm {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(reply) => Ok(GenerationResponse {
                    text: reply.clone(),
                    model: "test".to_string(),
                    tokens_used: None,
                    finish_reason: None,
                }),
                None => Err(LlmError::GenerationFailed("down".to_string()).into()),
            }
        }

        async fn generate_stream(
            &self,
            _messages: &[Message],
            _options: &GenerationOptions,
        ) -> Result<flume::Receiver<Result<String>>> {
            Err(LlmError::GenerationFailed("not used".to_string()).into())
        }
    }

    fn agent(llm: Arc<ScriptedLlm>) -> StructuringAgent {
        StructuringAgent::new(llm, 0.1, 1024)
    }

    #[tokio::test]
    async fn test_guardrail_skips_llm_on_empty_content() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "photo.png").unwrap();
        ws.save_text("").unwrap();

        let llm = Arc::new(ScriptedLlm::new(Some("{\"language\": \"x\"}")));
        let (path, record) = agent(llm.clone())
            .structure(&ws, InputKind::Image, "photo__1", "hash", "a", None)
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(record.language, "unknown");
        assert!(record
            .summary
            .starts_with("No extractable text found. Image file: photo__1"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_guardrail_uses_user_description() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "photo.png").unwrap();
        ws.save_text("").unwrap();

        let llm = Arc::new(ScriptedLlm::new(None));
        let (_, record) = agent(llm)
            .structure(
                &ws,
                InputKind::Image,
                "photo__1",
                "hash",
                "a",
                Some("A vacation photo"),
            )
            .await
            .unwrap();

        assert_eq!(
            record.summary,
            "No extractable text found. A vacation photo"
        );
    }

    #[tokio::test]
    async fn test_successful_parse() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "report.pdf").unwrap();
        ws.save_text("A long report about quarterly revenue growth across regions.")
            .unwrap();

        let llm = Arc::new(ScriptedLlm::new(Some(
            "{\"language\": \"english\", \"summary\": \"Quarterly revenue grew steadily across all regions.\"}",
        )));
        let (_, record) = agent(llm.clone())
            .structure(&ws, InputKind::Pdf, "report__1", "hash", "a", None)
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.language, "english");
        assert!(record.summary.contains("Quarterly revenue"));
        assert!(record.clean_content.is_some());
        assert!(record.tables.is_none());
    }

    #[tokio::test]
    async fn test_parse_failure_falls_back_to_excel_summary() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "book.xlsx").unwrap();
        ws.save_text("EXCEL WORKBOOK: book.xlsx").unwrap();
        ws.save_tables(&[Table {
            sheet: Some("Sales".to_string()),
            rows: 3,
            columns: 2,
            headers: vec!["date".to_string(), "amount".to_string()],
            data: vec![
                vec!["2024-01-01".to_string(), "100".to_string()],
                vec!["2024-01-02".to_string(), "200".to_string()],
                vec!["2024-01-03".to_string(), "300".to_string()],
            ],
            ..Table::default()
        }])
        .unwrap();

        // LLM returns garbage, the roll-up summary takes over
        let llm = Arc::new(ScriptedLlm::new(Some("not json at all")));
        let (_, record) = agent(llm)
            .structure(&ws, InputKind::Excel, "book__1", "hash", "a", None)
            .await
            .unwrap();

        assert!(record
            .summary
            .contains("Excel workbook with 1 sheet (Sales) containing 3 rows"));
        assert_eq!(record.tables_count, 1);
        assert!(record.tables.is_some());
        assert!(record.clean_content.is_none());
    }

    #[tokio::test]
    async fn test_clean_content_includes_image_analysis() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "doc.pdf").unwrap();
        ws.save_text("Body text of the document goes here.").unwrap();
        ws.save_json(
            &ws.images_dir().join("analysis.json"),
            &vec![ImageRecord {
                method: "vlm".to_string(),
                image: "fig.png".to_string(),
                content: "A line chart trending up".to_string(),
                confidence: None,
                is_graph: Some(true),
            }],
        )
        .unwrap();

        let llm = Arc::new(ScriptedLlm::new(Some(
            "{\"language\": \"english\", \"summary\": \"A document about something substantial.\"}",
        )));
        let (_, record) = agent(llm)
            .structure(&ws, InputKind::Pdf, "doc__1", "hash", "a", None)
            .await
            .unwrap();

        let content = record.clean_content.unwrap();
        assert!(content.contains("--- IMAGE ANALYSIS ---"));
        assert!(content.contains("[VLM - fig.png]: A line chart trending up"));
        assert_eq!(record.images_analysis.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_tables_persists_json() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "data.csv").unwrap();
        ws.save_tables(&[Table {
            sheet: Some("data".to_string()),
            rows: 1,
            columns: 1,
            headers: vec!["n".to_string()],
            data: vec![vec!["1".to_string()]],
            ..Table::default()
        }])
        .unwrap();

        let llm = Arc::new(ScriptedLlm::new(Some(
            "{\"data_type\": \"numbers\", \"column_descriptions\": {\"n\": \"a number\"}, \
             \"key_statistics\": [], \"patterns\": [], \"use_cases\": []}",
        )));
        let analysis = agent(llm)
            .analyze_tables(&ws, InputKind::Csv)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(analysis["data_type"], "numbers");
        assert!(ws.tables_dir().join("analysis.json").exists());
    }

    #[tokio::test]
    async fn test_analyze_tables_no_tables_is_none() {
        let tmp = TempDir::new().unwrap();
        let ws = DocumentWorkspace::create(tmp.path(), "empty.csv").unwrap();

        let llm = Arc::new(ScriptedLlm::new(Some("{}")));
        assert!(agent(llm)
            .analyze_tables(&ws, InputKind::Csv)
            .await
            .unwrap()
            .is_none());
    }
}
