//! Table model, preprocessing, and formatting

use serde::{Deserialize, Serialize};

/// A single extracted table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    /// Sheet name for workbook sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,

    /// Page number for paginated sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    /// Slide number for presentation sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slide: Option<u32>,

    /// 1-based sheet index for workbook sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_index: Option<u32>,

    /// Number of data rows (headers excluded)
    pub rows: usize,

    /// Number of columns
    pub columns: usize,

    /// Header row
    pub headers: Vec<String>,

    /// Data rows
    pub data: Vec<Vec<String>>,
}

impl Table {
    /// Display name used in chunk labels and prompts
    pub fn display_name(&self) -> String {
        if let Some(sheet) = &self.sheet {
            sheet.clone()
        } else if let Some(page) = self.page {
            format!("Page {}", page)
        } else if let Some(slide) = self.slide {
            format!("Slide {}", slide)
        } else {
            "Table".to_string()
        }
    }
}

/// Chart metadata extracted alongside workbook tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartInfo {
    /// Sheet the chart lives on
    pub sheet: String,

    /// Chart type identifier
    pub chart_type: String,

    /// Chart title when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Number of data series
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_series: Option<usize>,
}

/// Normalize a raw grid into a [`Table`].
///
/// Cleans cell values, drops all-empty rows (header kept) and all-empty
/// columns, collapses integer-valued floats, and splits the first row off
/// as headers.
pub fn preprocess_table(raw: Vec<Vec<String>>) -> Option<Table> {
    if raw.is_empty() {
        return None;
    }

    // Pass 1: clean cells
    let mut cleaned: Vec<Vec<String>> = raw
        .into_iter()
        .map(|row| row.into_iter().map(|cell| clean_cell(&cell)).collect())
        .collect();

    // Pass 2: drop all-empty data rows, keep the header row
    if cleaned.len() > 1 {
        let header = cleaned.remove(0);
        cleaned.retain(|row| row.iter().any(|cell| !cell.is_empty()));
        cleaned.insert(0, header);
    }

    // Pass 3: drop all-empty columns
    let num_cols = cleaned.iter().map(Vec::len).max().unwrap_or(0);
    let keep: Vec<usize> = (0..num_cols)
        .filter(|&col| {
            cleaned
                .iter()
                .any(|row| row.get(col).map(|c| !c.is_empty()).unwrap_or(false))
        })
        .collect();

    if keep.is_empty() {
        return None;
    }

    let cleaned: Vec<Vec<String>> = cleaned
        .into_iter()
        .map(|row| {
            keep.iter()
                .map(|&col| row.get(col).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    let mut iter = cleaned.into_iter();
    let headers = iter.next().unwrap_or_default();
    let data: Vec<Vec<String>> = iter.collect();

    Some(Table {
        rows: data.len(),
        columns: headers.len(),
        headers,
        data,
        ..Table::default()
    })
}

/// Clean a single cell value: trim whitespace, map null-ish markers to
/// empty, and collapse integer-valued floats ("32.0" becomes "32").
pub fn clean_cell(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.to_lowercase().as_str() {
        "" | "none" | "null" | "nan" => return String::new(),
        _ => {}
    }

    if let Ok(parsed) = trimmed.parse::<f64>() {
        if parsed.fract() == 0.0 && trimmed.contains('.') && parsed.abs() < i64::MAX as f64 {
            return format!("{}", parsed as i64);
        }
    }

    trimmed.to_string()
}

/// Render a table as a markdown grid for `content.txt`
pub fn format_table_as_markdown(table: &Table) -> String {
    if table.headers.is_empty() && table.data.is_empty() {
        return String::new();
    }

    let mut lines = Vec::new();

    if !table.headers.is_empty() {
        lines.push(format!("| {} |", table.headers.join(" | ")));
        lines.push(format!(
            "| {} |",
            table
                .headers
                .iter()
                .map(|_| "---")
                .collect::<Vec<_>>()
                .join(" | ")
        ));
    }

    for row in &table.data {
        lines.push(format!("| {} |", row.join(" | ")));
    }

    lines.join("\n")
}

/// Detect headers of columns that are predominantly (> 70%) numeric
pub fn detect_numeric_columns(table: &Table) -> Vec<String> {
    let mut numeric = Vec::new();

    for (col, header) in table.headers.iter().enumerate() {
        let mut numeric_count = 0usize;
        let mut total = 0usize;

        for row in &table.data {
            if let Some(cell) = row.get(col) {
                if cell.is_empty() {
                    continue;
                }
                total += 1;
                let candidate = cell.replace(',', "").replace('$', "");
                if candidate.parse::<f64>().is_ok() {
                    numeric_count += 1;
                }
            }
        }

        if total > 0 && numeric_count as f64 / total as f64 > 0.7 {
            numeric.push(if header.is_empty() {
                format!("Column {}", col + 1)
            } else {
                header.clone()
            });
        }
    }

    numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_preprocess_drops_empty_rows_and_columns() {
        let raw = grid(&[
            &["name", "age", ""],
            &["alice", "30.0", ""],
            &["", "", ""],
            &["bob", "25", ""],
        ]);

        let table = preprocess_table(raw).unwrap();
        assert_eq!(table.headers, vec!["name", "age"]);
        assert_eq!(table.rows, 2);
        assert_eq!(table.data[0], vec!["alice", "30"]);
        assert_eq!(table.data[1], vec!["bob", "25"]);
    }

    #[test]
    fn test_clean_cell_collapses_integer_floats() {
        assert_eq!(clean_cell("32.0"), "32");
        assert_eq!(clean_cell("32.5"), "32.5");
        assert_eq!(clean_cell("  hello "), "hello");
        assert_eq!(clean_cell("None"), "");
        assert_eq!(clean_cell("nan"), "");
    }

    #[test]
    fn test_markdown_rendering() {
        let table = preprocess_table(grid(&[&["a", "b"], &["1", "2"]])).unwrap();
        let md = format_table_as_markdown(&table);
        assert!(md.starts_with("| a | b |"));
        assert!(md.contains("| --- | --- |"));
        assert!(md.ends_with("| 1 | 2 |"));
    }

    #[test]
    fn test_numeric_column_detection() {
        let table = preprocess_table(grid(&[
            &["city", "revenue"],
            &["cairo", "100"],
            &["lyon", "2,500"],
            &["oslo", "$300"],
        ]))
        .unwrap();

        assert_eq!(detect_numeric_columns(&table), vec!["revenue"]);
    }

    #[test]
    fn test_empty_table() {
        assert!(preprocess_table(vec![]).is_none());
        assert!(preprocess_table(grid(&[&["", ""], &["", ""]])).is_none());
    }
}
