//! Web page extractor: scrape text and linked images

use crate::config::ScraperConfig;
use crate::error::{ExtractError, Result};
use crate::extract::{Extraction, Extractor, IngestInput, InputKind};
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Linked images fetched per page
const MAX_LINKED_IMAGES: usize = 5;

/// Extractor for plain web URLs
pub struct UrlExtractor {
    client: reqwest::Client,
    config: ScraperConfig,
}

impl UrlExtractor {
    pub fn new(config: ScraperConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(config.user_agent.clone())
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Pull readable text out of the parsed page
    fn page_text(document: &Html) -> (Option<String>, String, Vec<String>) {
        let title = Selector::parse("title")
            .ok()
            .and_then(|sel| document.select(&sel).next())
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let content_selector =
            Selector::parse("p, h1, h2, h3, h4, h5, h6, li, td, th, blockquote, pre")
                .expect("static selector");

        let mut parts = Vec::new();
        for element in document.select(&content_selector) {
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                parts.push(text);
            }
        }

        let img_selector = Selector::parse("img[src]").expect("static selector");
        let image_urls: Vec<String> = document
            .select(&img_selector)
            .filter_map(|el| el.value().attr("src"))
            .filter(|src| src.starts_with("http://") || src.starts_with("https://"))
            .map(str::to_string)
            .collect();

        (title, parts.join("\n"), image_urls)
    }

    async fn fetch_images(
        &self,
        urls: &[String],
        workspace: &DocumentWorkspace,
    ) -> Vec<PathBuf> {
        let mut saved = Vec::new();

        for (idx, url) in urls.iter().take(MAX_LINKED_IMAGES).enumerate() {
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    let Ok(bytes) = response.bytes().await else {
                        continue;
                    };
                    let ext = url.rsplit('.').next().filter(|e| e.len() <= 4).unwrap_or("jpg");
                    let dest = workspace
                        .images_dir()
                        .join(format!("linked_{}.{}", idx, ext));
                    if std::fs::write(&dest, &bytes).is_ok() {
                        saved.push(dest);
                    }
                }
                Ok(response) => {
                    debug!("Skipping linked image {} (HTTP {})", url, response.status());
                }
                Err(e) => {
                    debug!("Failed to fetch linked image {}: {}", url, e);
                }
            }
        }

        saved
    }
}

#[async_trait]
impl Extractor for UrlExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::Url(url) = input else {
            return Err(ExtractError::Unsupported("url extractor needs a URL".to_string()).into());
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExtractError::DownloadFailed(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ExtractError::DownloadFailed(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            ))
            .into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExtractError::DownloadFailed(e.to_string()))?;
        if body.len() > self.config.max_content_length {
            warn!("Page body exceeds limit, truncating: {}", url);
        }
        let body: String = body
            .chars()
            .take(self.config.max_content_length)
            .collect();

        // scraper's Html is not Send, keep it scoped before any await
        let (title, text, image_urls) = {
            let document = Html::parse_document(&body);
            Self::page_text(&document)
        };

        if text.trim().is_empty() {
            return Err(ExtractError::Empty(format!("No readable text at {}", url)).into());
        }

        let page_name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty() && !segment.contains('.'))
            .unwrap_or("webpage");
        let workspace = DocumentWorkspace::create(workspace_root, page_name)?;

        let mut content = String::new();
        if let Some(title) = &title {
            content.push_str(&format!("TITLE: {}\n\n", title));
        }
        content.push_str(&format!("URL: {}\n\n", url));
        content.push_str(&text);
        workspace.save_text(&content)?;

        let images = self.fetch_images(&image_urls, &workspace).await;

        workspace.save_metadata(&serde_json::json!({
            "source": "url",
            "url": url,
            "title": title,
            "images_found": images.len(),
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images,
            doc_id,
            kind: InputKind::Url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_url_extraction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>Test Page</title></head><body>\
                 <h1>Heading</h1><p>First paragraph.</p>\
                 <script>var x = 1;</script>\
                 <p>Second paragraph.</p></body></html>",
            ))
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let extractor = UrlExtractor::new(ScraperConfig::default());
        let url = format!("{}/article", server.uri());
        let extraction = extractor
            .extract(&IngestInput::Url(url), tmp.path())
            .await
            .unwrap();

        assert_eq!(extraction.kind, InputKind::Url);
        let text = extraction.workspace.read_text();
        assert!(text.contains("TITLE: Test Page"));
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Second paragraph."));
        assert!(!text.contains("var x = 1"));
    }

    #[tokio::test]
    async fn test_url_extraction_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let extractor = UrlExtractor::new(ScraperConfig::default());
        let result = extractor
            .extract(&IngestInput::Url(server.uri()), tmp.path())
            .await;
        assert!(result.is_err());
    }
}
