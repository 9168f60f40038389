//! Hybrid image understanding: OCR first, VLM fallback by confidence

use crate::config::{OcrConfig, VlmConfig};
use crate::error::{LlmError, Result};
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Images smaller than this are icons/noise and skipped entirely
const MIN_IMAGE_BYTES: u64 = 5 * 1024;

/// Upper bound on VLM calls per document
const MAX_VLM_IMAGES: usize = 10;

/// Minimum accepted image dimensions for the VLM stage
const MIN_VLM_DIMENSION: u32 = 50;

/// Minimum OCR text length for an accepted result
const MIN_OCR_TEXT_LEN: usize = 10;

/// Prompt sent with every VLM request
const VLM_PROMPT: &str = "Describe this image in detail. If it contains text, transcribe it. \
If it is a chart or graph, summarize the key trends.";

/// Per-image analysis record persisted to the workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Analysis method ("ocr" or "vlm")
    pub method: String,

    /// Image file name
    pub image: String,

    /// Extracted text or generated description
    pub content: String,

    /// OCR confidence when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    /// Whether the VLM judged the image to be a chart or graph
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_graph: Option<bool>,
}

/// OCR metadata persisted when OCR output replaces thin document text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrMetadata {
    pub engine: String,
    pub confidence: f32,
    pub images_processed: usize,
}

/// Seam for the external OCR engine.
///
/// Implementations are synchronous; the analyzer runs them on the
/// blocking thread pool.
pub trait OcrEngine: Send + Sync {
    /// Recognize text in an image, returning `(text, confidence)` with
    /// confidence in `[0, 1]`
    fn recognize(&self, image: &Path) -> Result<(String, f32)>;
}

/// OCR client speaking to a sidecar HTTP service
pub struct HttpOcrClient {
    config: OcrConfig,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl HttpOcrClient {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }
}

impl OcrEngine for HttpOcrClient {
    fn recognize(&self, image: &Path) -> Result<(String, f32)> {
        // Built per call so the blocking client never lives on an async thread
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout))
            .build()
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        let bytes = fs::read(image)?;
        let response = client
            .post(&self.config.endpoint)
            .query(&[("gpu", self.config.gpu.to_string())])
            .body(bytes)
            .send()
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(
                LlmError::VisionFailed(format!("OCR HTTP {}", response.status())).into(),
            );
        }

        let parsed: OcrResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok((parsed.text, parsed.confidence))
    }
}

/// Result of a single VLM call
#[derive(Debug, Clone)]
pub struct VisionAnalysis {
    pub description: String,
    pub is_graph: bool,
}

/// Seam for the external vision model
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Describe or transcribe an image
    async fn describe(&self, image: &Path) -> Result<VisionAnalysis>;
}

/// Vision client with a per-provider model whitelist
pub struct VlmClient {
    client: reqwest::Client,
    config: VlmConfig,
    model: String,
}

/// Verified models per provider
const SUPPORTED_MODELS: &[(&str, &[&str])] = &[
    (
        "remote-a",
        &[
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "meta-llama/llama-4-maverick-17b-128e-instruct",
        ],
    ),
    ("remote-b", &["pixtral-12b-2409"]),
    ("local", &["Qwen/Qwen2.5-VL-7B-Instruct"]),
];

const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("remote-a", "meta-llama/llama-4-scout-17b-16e-instruct"),
    ("remote-b", "pixtral-12b-2409"),
    ("local", "Qwen/Qwen2.5-VL-7B-Instruct"),
];

/// Resolve the model to use: unknown models fall back to the provider
/// default
pub fn resolve_vlm_model(provider: &str, requested: &str) -> Option<String> {
    let default = DEFAULT_MODELS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, m)| m.to_string())?;

    let supported = SUPPORTED_MODELS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, models)| *models)
        .unwrap_or(&[]);

    if supported.contains(&requested) {
        Some(requested.to_string())
    } else {
        warn!(
            "Model '{}' not supported by {}, using default '{}'",
            requested, provider, default
        );
        Some(default)
    }
}

#[derive(Debug, Deserialize)]
struct VlmResponse {
    choices: Vec<VlmChoice>,
}

#[derive(Debug, Deserialize)]
struct VlmChoice {
    message: VlmMessage,
}

#[derive(Debug, Deserialize)]
struct VlmMessage {
    #[serde(default)]
    content: String,
}

impl VlmClient {
    /// Create a vision client, enforcing the model whitelist
    pub fn new(config: VlmConfig) -> Result<Self> {
        let model = resolve_vlm_model(&config.provider, &config.model).ok_or_else(|| {
            LlmError::VisionFailed(format!("Unknown vision provider: {}", config.provider))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            client,
            config,
            model,
        })
    }

    /// Normalize an image to JPEG bytes, rejecting tiny dimensions
    fn normalize_to_jpeg(image_path: &Path) -> Result<Vec<u8>> {
        let img = image::open(image_path)
            .map_err(|e| LlmError::VisionFailed(format!("Failed to decode image: {}", e)))?;

        if img.width() < MIN_VLM_DIMENSION || img.height() < MIN_VLM_DIMENSION {
            return Err(LlmError::VisionFailed(format!(
                "Image too small for analysis: {}x{}",
                img.width(),
                img.height()
            ))
            .into());
        }

        let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
        let mut buf = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .map_err(|e| LlmError::VisionFailed(format!("JPEG encode failed: {}", e)))?;

        Ok(buf)
    }
}

#[async_trait]
impl VisionProvider for VlmClient {
    async fn describe(&self, image: &Path) -> Result<VisionAnalysis> {
        let jpeg = Self::normalize_to_jpeg(image)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": VLM_PROMPT},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/jpeg;base64,{}", encoded)
                    }}
                ]
            }],
            "max_tokens": 1024
        });

        let mut request = self.client.post(&self.config.api_url).json(&payload);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::ConnectionFailed(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::VisionFailed(format!("HTTP {}: {}", status, body)).into());
        }

        let parsed: VlmResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let lowered = content.to_lowercase();
        Ok(VisionAnalysis {
            is_graph: lowered.contains("chart") || lowered.contains("graph"),
            description: content,
        })
    }
}

/// Arbitrates between OCR and the vision model per image
pub struct ImageAnalyzer {
    ocr: Arc<dyn OcrEngine>,
    vision: Arc<dyn VisionProvider>,
    threshold: f32,
}

impl ImageAnalyzer {
    pub fn new(ocr: Arc<dyn OcrEngine>, vision: Arc<dyn VisionProvider>, threshold: f32) -> Self {
        Self {
            ocr,
            vision,
            threshold,
        }
    }

    /// Run the OCR-then-VLM pipeline over a document's images.
    ///
    /// Accepted OCR results and VLM descriptions are appended to
    /// `content.txt` as human-readable blocks; records are persisted to
    /// `images/ocr_analysis.json` and `images/analysis.json`.
    pub async fn process(
        &self,
        workspace: &DocumentWorkspace,
        images: &[PathBuf],
    ) -> Result<Vec<ImageRecord>> {
        let candidates: Vec<PathBuf> = images
            .iter()
            .filter(|path| {
                fs::metadata(path)
                    .map(|m| m.len() >= MIN_IMAGE_BYTES)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if candidates.is_empty() {
            debug!("No significant images to analyze");
            return Ok(Vec::new());
        }

        info!("Running OCR on {} images", candidates.len());

        let mut ocr_records = Vec::new();
        let mut vlm_queue = Vec::new();

        for path in candidates {
            let engine = Arc::clone(&self.ocr);
            let ocr_path = path.clone();
            // OCR is CPU-bound, keep it off the async threads
            let outcome =
                tokio::task::spawn_blocking(move || engine.recognize(&ocr_path)).await;

            let (text, confidence) = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("OCR failed for {}: {}", path.display(), e);
                    (String::new(), 0.0)
                }
                Err(e) => {
                    warn!("OCR task panicked for {}: {}", path.display(), e);
                    (String::new(), 0.0)
                }
            };

            let name = file_name(&path);
            let trimmed = text.trim();

            if confidence >= self.threshold && trimmed.len() >= MIN_OCR_TEXT_LEN {
                workspace.append_text(&format!("[Image Text ({}): {}]", name, trimmed))?;
                copy_into(&path, &workspace.images_dir().join("ocr_processed"));
                ocr_records.push(ImageRecord {
                    method: "ocr".to_string(),
                    image: name,
                    content: trimmed.to_string(),
                    confidence: Some(confidence),
                    is_graph: None,
                });
            } else {
                vlm_queue.push(path);
            }
        }

        // Largest images first; assume they carry the most content
        vlm_queue.sort_by_key(|path| {
            std::cmp::Reverse(fs::metadata(path).map(|m| m.len()).unwrap_or(0))
        });
        vlm_queue.truncate(MAX_VLM_IMAGES);

        let mut vlm_records = Vec::new();
        for path in &vlm_queue {
            let name = file_name(path);
            match self.vision.describe(path).await {
                Ok(analysis) => {
                    workspace.append_text(&format!(
                        "[Image Description ({}): {}]",
                        name, analysis.description
                    ))?;
                    copy_into(path, &workspace.images_dir().join("vlm_processed"));
                    vlm_records.push(ImageRecord {
                        method: "vlm".to_string(),
                        image: name,
                        content: analysis.description,
                        confidence: None,
                        is_graph: Some(analysis.is_graph),
                    });
                }
                Err(e) => {
                    warn!("VLM analysis failed for {}: {}", name, e);
                }
            }
        }

        if !ocr_records.is_empty() {
            workspace.save_json(
                &workspace.images_dir().join("ocr_analysis.json"),
                &ocr_records,
            )?;
        }
        if !vlm_records.is_empty() {
            workspace.save_json(&workspace.images_dir().join("analysis.json"), &vlm_records)?;
        }

        info!(
            "Image analysis complete: {} OCR, {} VLM",
            ocr_records.len(),
            vlm_records.len()
        );

        let mut combined = ocr_records;
        combined.extend(vlm_records);
        Ok(combined)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn copy_into(path: &Path, dir: &Path) {
    let _ = fs::create_dir_all(dir);
    let _ = fs::copy(path, dir.join(file_name(path)));
}
