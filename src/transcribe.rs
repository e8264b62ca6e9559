//! Speech transcription
//!
//! Sends a local video to the Video Intelligence `videos:annotate` endpoint
//! with speech transcription enabled, polls the long-running operation and
//! writes the most likely transcript with per-word timings to a text file.

use crate::config::{AnalysisSettings, TranscriptionSettings};
use crate::credentials::AccessToken;
use crate::encoder;
use crate::error::TranscriptionError;
use crate::input;
use anyhow::Context;
use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const SPEECH_TRANSCRIPTION: &str = "SPEECH_TRANSCRIPTION";

/// Result of a finished transcription
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TranscriptSummary {
    pub(crate) output: PathBuf,
    pub(crate) segments: usize,
    pub(crate) words: usize,
}

/// Default output path: `<video stem>.transcript.txt` next to the video
pub(crate) fn transcript_path_for(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    video.with_file_name(format!("{}.transcript.txt", stem))
}

pub(crate) struct Transcriber {
    client: reqwest::Client,
    settings: TranscriptionSettings,
    analysis: AnalysisSettings,
}

impl Transcriber {
    pub(crate) fn new(
        settings: &TranscriptionSettings,
        analysis: &AnalysisSettings,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.operation_timeout())
            .build()
            .context("Failed to create HTTP client for Transcriber")?;

        Ok(Self {
            client,
            settings: TranscriptionSettings {
                api_base: settings.api_base.trim_end_matches('/').to_string(),
                ..settings.clone()
            },
            analysis: analysis.clone(),
        })
    }

    /// Transcribe a local video and write the transcript to `output`
    #[instrument(skip(self, token))]
    pub(crate) async fn transcribe_file(
        &self,
        video: &Path,
        output: &Path,
        token: &AccessToken,
    ) -> Result<TranscriptSummary, TranscriptionError> {
        let blob = input::video_from_file(video, &self.analysis).await?;
        let attachment = encoder::encode(&blob).await?;

        let transcriptions = self.transcribe(&attachment.data, token).await?;
        let rendered = render_transcript(&transcriptions);
        if rendered.is_empty() {
            return Err(TranscriptionError::NoSpeech);
        }
        tokio::fs::write(output, rendered).await?;

        let best: Vec<&Alternative> = transcriptions
            .iter()
            .filter_map(|t| t.alternatives.first())
            .collect();
        let summary = TranscriptSummary {
            output: output.to_path_buf(),
            segments: best.len(),
            words: best.iter().map(|a| a.words.len()).sum(),
        };
        info!(output = %output.display(), segments = summary.segments, words = summary.words, "Transcript saved");
        Ok(summary)
    }

    async fn transcribe(
        &self,
        input_content: &str,
        token: &AccessToken,
    ) -> Result<Vec<SpeechTranscription>, TranscriptionError> {
        let request = AnnotateVideoRequest {
            input_content,
            features: [SPEECH_TRANSCRIPTION],
            video_context: VideoContext {
                speech_transcription_config: SpeechTranscriptionConfig {
                    language_code: &self.settings.language_code,
                    enable_automatic_punctuation: true,
                },
            },
        };

        let url = format!("{}/videos:annotate", self.settings.api_base);
        let started = self
            .send(self.client.post(&url).json(&request), token)
            .await?;
        info!(operation = %started.name, "Transcription started");

        let timeout = self.settings.operation_timeout();
        let response = tokio::time::timeout(timeout, self.wait(&started.name, token))
            .await
            .map_err(|_| TranscriptionError::Timeout(timeout.as_secs()))??;

        let result = response
            .annotation_results
            .into_iter()
            .next()
            .ok_or_else(|| TranscriptionError::Operation("no annotation results".to_string()))?;
        if let Some(error) = result.error {
            return Err(TranscriptionError::Operation(error.message));
        }
        Ok(result.speech_transcriptions)
    }

    /// Poll the operation until it is done
    async fn wait(
        &self,
        name: &str,
        token: &AccessToken,
    ) -> Result<AnnotateVideoResponse, TranscriptionError> {
        let url = format!("{}/{}", self.settings.api_base, name);
        loop {
            let operation = self.send(self.client.get(&url), token).await?;
            if operation.done {
                if let Some(error) = operation.error {
                    return Err(TranscriptionError::Operation(error.message));
                }
                return operation.response.ok_or_else(|| {
                    TranscriptionError::Operation("operation finished without a result".to_string())
                });
            }
            debug!(operation = %name, "Transcription still running");
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        token: &AccessToken,
    ) -> Result<Operation, TranscriptionError> {
        let response = request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Video Intelligence API rejected the request");
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| body.trim().to_string());
            return Err(TranscriptionError::Request(format!(
                "HTTP {}: {}",
                status.as_u16(),
                message
            )));
        }

        response
            .json::<Operation>()
            .await
            .map_err(|e| TranscriptionError::Request(format!("invalid response: {}", e)))
    }
}

/// Render the most likely alternative of each segment with word timings
pub(crate) fn render_transcript(transcriptions: &[SpeechTranscription]) -> String {
    let mut out = String::new();
    for alternative in transcriptions.iter().filter_map(|t| t.alternatives.first()) {
        out.push_str("--- FULL TRANSCRIPT ---\n");
        out.push_str(&format!("{}\n\n", alternative.transcript.trim()));
        out.push_str(&format!("Confidence: {:.2}%\n", alternative.confidence * 100.0));
        out.push_str("\n--- WORD TIMESTAMPS ---\n");
        for word in &alternative.words {
            out.push_str(&format!(
                "[{:7.3}s - {:7.3}s] {}\n",
                word.start_time, word.end_time, word.word
            ));
        }
    }
    out
}

/// Parse a protobuf JSON duration such as `"1.500s"` into seconds
fn parse_duration(raw: &str) -> Option<f64> {
    raw.trim().strip_suffix('s')?.parse().ok()
}

fn duration_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).ok_or_else(|| D::Error::custom(format!("invalid duration '{}'", raw)))
}

// ============================================================================
// Video Intelligence API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateVideoRequest<'a> {
    input_content: &'a str,
    features: [&'static str; 1],
    video_context: VideoContext<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoContext<'a> {
    speech_transcription_config: SpeechTranscriptionConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechTranscriptionConfig<'a> {
    language_code: &'a str,
    enable_automatic_punctuation: bool,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<Status>,
    response: Option<AnnotateVideoResponse>,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Status,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateVideoResponse {
    #[serde(default)]
    annotation_results: Vec<AnnotationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationResult {
    #[serde(default)]
    speech_transcriptions: Vec<SpeechTranscription>,
    error: Option<Status>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SpeechTranscription {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    words: Vec<WordInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WordInfo {
    #[serde(deserialize_with = "duration_seconds")]
    start_time: f64,
    #[serde(deserialize_with = "duration_seconds")]
    end_time: f64,
    word: String,
}
