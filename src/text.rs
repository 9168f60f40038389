//! Text cleanup and JSON extraction helpers

use crate::error::{ArchiveError, Result};
use regex::Regex;

/// Preprocess document text before it is shown to the LLM.
///
/// Strips page-number noise and collapses runs of three or more blank
/// lines down to two.
pub fn preprocess_text(text: &str) -> String {
    let page_numbers = Regex::new(r"(?i)Page\s+\d+\s+of\s+\d+").expect("static regex");
    let text = page_numbers.replace_all(text, "");

    let blank_runs = Regex::new(r"\n{3,}").expect("static regex");
    let text = blank_runs.replace_all(&text, "\n\n");

    text.trim().to_string()
}

/// Remove control characters that break JSON payloads.
///
/// Keeps newlines and tabs, normalizes line endings, drops the rest.
pub fn sanitize_control_chars(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Extract a JSON object from an LLM reply.
///
/// Prefers a fenced ```json block, falls back to the first raw brace
/// span. Errors when no object can be located.
pub fn extract_json(text: &str) -> Result<String> {
    let fenced = Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("static regex");
    if let Some(caps) = fenced.captures(text) {
        return Ok(caps[1].trim().to_string());
    }

    let raw = Regex::new(r"\{[\s\S]*\}").expect("static regex");
    match raw.find(text) {
        Some(m) => Ok(m.as_str().trim().to_string()),
        None => Err(ArchiveError::InvalidInput(
            "No JSON found in LLM response".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_strips_page_numbers() {
        let text = "Intro\nPage 1 of 10\nBody";
        let cleaned = preprocess_text(text);
        assert!(!cleaned.contains("Page 1 of 10"));
        assert!(cleaned.contains("Body"));
    }

    #[test]
    fn test_preprocess_collapses_blank_lines() {
        let text = "a\n\n\n\n\nb";
        assert_eq!(preprocess_text(text), "a\n\nb");
    }

    #[test]
    fn test_sanitize_control_chars() {
        let text = "a\u{0}b\r\nc\u{b}d";
        let cleaned = sanitize_control_chars(text);
        assert_eq!(cleaned, "ab\ncd");
    }

    #[test]
    fn test_extract_json_fenced() {
        let reply = "Here you go:\n```json\n{\"language\": \"english\"}\n```";
        let json = extract_json(reply).unwrap();
        assert_eq!(json, "{\"language\": \"english\"}");
    }

    #[test]
    fn test_extract_json_raw() {
        let reply = "prefix {\"summary\": \"ok\"} suffix";
        let json = extract_json(reply).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
    }

    #[test]
    fn test_extract_json_missing() {
        assert!(extract_json("no json here").is_err());
    }
}
