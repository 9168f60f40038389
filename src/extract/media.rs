//! Audio/video and streaming-platform extractors
//!
//! Both converge on the transcription seam: media files get their audio
//! track lifted with ffmpeg when needed, streamed videos are downloaded
//! through the fetcher seam, and the transcript becomes the document
//! text.

use crate::error::{ExtractError, Result};
use crate::extract::{
    Extraction, Extractor, IngestInput, InputKind, MediaFetcher, Transcriber,
};
use crate::workspace::DocumentWorkspace;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm"];

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extractor for local audio and video files
pub struct MediaExtractor {
    transcriber: Arc<dyn Transcriber>,
}

impl MediaExtractor {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }

    /// Lift the audio track out of a video container
    async fn extract_audio(&self, video: &Path, dest_dir: &Path) -> Result<PathBuf> {
        let dest = dest_dir.join("audio.wav");
        debug!("Extracting audio track from {}", video.display());

        let status = Command::new("ffmpeg")
            .args(["-y", "-i"])
            .arg(video)
            .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
            .arg(&dest)
            .status()
            .await
            .map_err(|e| ExtractError::TranscriptionFailed(format!("ffmpeg spawn failed: {}", e)))?;

        if !status.success() {
            return Err(
                ExtractError::TranscriptionFailed(format!("ffmpeg exited with {}", status)).into(),
            );
        }

        Ok(dest)
    }
}

#[async_trait]
impl Extractor for MediaExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::File(path) = input else {
            return Err(ExtractError::Unsupported("media extractor needs a file".to_string()).into());
        };

        let workspace = DocumentWorkspace::create(workspace_root, &input.display_name())?;

        let audio_path = if is_video(path) {
            self.extract_audio(path, &workspace.audio_dir()).await?
        } else {
            let dest = workspace.audio_dir().join(input.display_name());
            std::fs::copy(path, &dest)?;
            dest
        };

        info!("Transcribing {}", audio_path.display());
        let transcript = self.transcriber.transcribe(&audio_path).await?;
        if transcript.trim().is_empty() {
            return Err(ExtractError::Empty("Transcription produced no text".to_string()).into());
        }

        workspace.save_text(&format!(
            "MEDIA TRANSCRIPT: {}\n\n{}",
            input.display_name(),
            transcript
        ))?;
        workspace.save_metadata(&serde_json::json!({
            "source": "media",
            "is_video": is_video(path),
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images: Vec::new(),
            doc_id,
            kind: InputKind::Media,
        })
    }
}

/// Extractor for YouTube links: download audio, then transcribe
pub struct YoutubeExtractor {
    fetcher: Arc<dyn MediaFetcher>,
    transcriber: Arc<dyn Transcriber>,
}

impl YoutubeExtractor {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            fetcher,
            transcriber,
        }
    }

    /// Derive a workspace name from the video id when possible
    fn video_name(url: &str) -> String {
        let candidate = url
            .split(['=', '/'])
            .filter(|part| !part.is_empty())
            .next_back()
            .unwrap_or("youtube");
        let cleaned: String = candidate
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if cleaned.is_empty() {
            "youtube".to_string()
        } else {
            cleaned
        }
    }
}

#[async_trait]
impl Extractor for YoutubeExtractor {
    async fn extract(&self, input: &IngestInput, workspace_root: &Path) -> Result<Extraction> {
        let IngestInput::Youtube(url) = input else {
            return Err(
                ExtractError::Unsupported("youtube extractor needs a youtube URL".to_string())
                    .into(),
            );
        };

        let workspace = DocumentWorkspace::create(workspace_root, &Self::video_name(url))?;

        info!("Downloading audio for {}", url);
        let audio_path = self.fetcher.fetch_audio(url, &workspace.audio_dir()).await?;

        let transcript = self.transcriber.transcribe(&audio_path).await?;
        if transcript.trim().is_empty() {
            return Err(ExtractError::Empty("Transcription produced no text".to_string()).into());
        }

        workspace.save_text(&format!("YOUTUBE TRANSCRIPT: {}\n\n{}", url, transcript))?;
        workspace.save_metadata(&serde_json::json!({
            "source": "youtube",
            "url": url,
        }))?;

        let doc_id = workspace.doc_id().to_string();
        Ok(Extraction {
            workspace,
            images: Vec::new(),
            doc_id,
            kind: InputKind::Youtube,
        })
    }
}

/// Downloader shelling out to yt-dlp
pub struct YtDlpFetcher;

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch_audio(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let template = dest_dir.join("audio.%(ext)s");
        let status = Command::new("yt-dlp")
            .args(["-x", "--audio-format", "mp3", "-o"])
            .arg(&template)
            .arg(url)
            .status()
            .await
            .map_err(|e| ExtractError::DownloadFailed(format!("yt-dlp spawn failed: {}", e)))?;

        if !status.success() {
            return Err(
                ExtractError::DownloadFailed(format!("yt-dlp exited with {}", status)).into(),
            );
        }

        let audio = dest_dir.join("audio.mp3");
        if !audio.exists() {
            return Err(ExtractError::DownloadFailed(
                "yt-dlp produced no audio file".to_string(),
            )
            .into());
        }
        Ok(audio)
    }
}

/// Transcription client speaking to a speech-to-text HTTP service
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: crate::config::WhisperConfig,
}

#[derive(Debug, serde::Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

impl HttpTranscriber {
    pub fn new(config: crate::config::WhisperConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, media: &Path) -> Result<String> {
        let bytes = std::fs::read(media)?;
        let file_name = media
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model_size", self.config.model_size.clone())
            .text("device", self.config.device.clone());

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExtractError::TranscriptionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExtractError::TranscriptionFailed(format!(
                "HTTP {}",
                response.status()
            ))
            .into());
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::TranscriptionFailed(e.to_string()))?;

        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedTranscriber(String);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _media: &Path) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FixedFetcher;

    #[async_trait]
    impl MediaFetcher for FixedFetcher {
        async fn fetch_audio(&self, _url: &str, dest_dir: &Path) -> Result<PathBuf> {
            let path = dest_dir.join("audio.mp3");
            std::fs::write(&path, b"audio bytes").unwrap();
            Ok(path)
        }
    }

    #[test]
    fn test_video_detection() {
        assert!(is_video(Path::new("clip.mp4")));
        assert!(is_video(Path::new("clip.MKV")));
        assert!(!is_video(Path::new("song.mp3")));
    }

    #[test]
    fn test_video_name_from_url() {
        assert_eq!(
            YoutubeExtractor::video_name("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            "dQw4w9WgXcQ"
        );
        assert_eq!(
            YoutubeExtractor::video_name("https://youtu.be/abc123"),
            "abc123"
        );
    }

    #[tokio::test]
    async fn test_audio_file_transcription() {
        let tmp = TempDir::new().unwrap();
        let audio = tmp.path().join("talk.mp3");
        std::fs::write(&audio, b"pretend audio").unwrap();

        let extractor =
            MediaExtractor::new(Arc::new(FixedTranscriber("hello from the talk".to_string())));
        let extraction = extractor
            .extract(&IngestInput::File(audio), tmp.path())
            .await
            .unwrap();

        assert_eq!(extraction.kind, InputKind::Media);
        let text = extraction.workspace.read_text();
        assert!(text.contains("MEDIA TRANSCRIPT: talk.mp3"));
        assert!(text.contains("hello from the talk"));
    }

    #[tokio::test]
    async fn test_empty_transcript_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let audio = tmp.path().join("quiet.mp3");
        std::fs::write(&audio, b"pretend audio").unwrap();

        let extractor = MediaExtractor::new(Arc::new(FixedTranscriber("  ".to_string())));
        let result = extractor
            .extract(&IngestInput::File(audio), tmp.path())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_youtube_extraction() {
        let tmp = TempDir::new().unwrap();
        let extractor = YoutubeExtractor::new(
            Arc::new(FixedFetcher),
            Arc::new(FixedTranscriber("video transcript".to_string())),
        );

        let extraction = extractor
            .extract(
                &IngestInput::Youtube("https://youtu.be/abc123".to_string()),
                tmp.path(),
            )
            .await
            .unwrap();

        assert_eq!(extraction.kind, InputKind::Youtube);
        assert!(extraction.doc_id.starts_with("abc123__"));
        assert!(extraction.workspace.read_text().contains("video transcript"));
    }
}
