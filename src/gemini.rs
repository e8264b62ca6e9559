//! Gemini REST backend.
//!
//! Opens `streamGenerateContent` with server-sent events and exposes the
//! response as a lazy stream of text increments. Dropping the stream drops
//! the HTTP body, which abandons the request.

use crate::config::GeminiSettings;
use crate::credentials::GeminiCredentials;
use crate::encoder::Attachment;
use crate::error::ChatError;
use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Lazy, finite sequence of text increments for one turn.
pub(crate) type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// One streaming generation call
pub(crate) struct TurnRequest {
    pub(crate) model: String,
    pub(crate) credentials: GeminiCredentials,
    pub(crate) body: GenerateContentRequest,
}

/// Remote generation service.
#[async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    async fn stream_generate(&self, request: TurnRequest) -> Result<FragmentStream, ChatError>;
}

/// Client for the Gemini generative language API.
pub(crate) struct GeminiClient {
    api_base: String,
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl GeminiClient {
    pub(crate) fn new(settings: &GeminiSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()
            .context("Failed to create HTTP client for GeminiClient")?;

        Ok(Self {
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            client,
            idle_timeout: settings.stream_idle_timeout(),
        })
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.api_base, model
        )
    }
}

#[async_trait]
impl ChatBackend for GeminiClient {
    #[instrument(skip(self, request), fields(model = %request.model, contents = request.body.contents.len()))]
    async fn stream_generate(&self, request: TurnRequest) -> Result<FragmentStream, ChatError> {
        let url = self.stream_url(&request.model);

        let pending = self
            .client
            .post(&url)
            .header("x-goog-api-key", request.credentials.api_key())
            .json(&request.body)
            .send();
        let response = tokio::time::timeout(self.idle_timeout, pending)
            .await
            .map_err(|_| idle_error(self.idle_timeout))?
            .map_err(|e| ChatError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gemini API rejected the request");
            return Err(classify_http_error(status, &body));
        }

        debug!("Gemini stream opened");
        Ok(sse_fragments(response.bytes_stream(), self.idle_timeout))
    }
}

/// Map a non-success response onto the error taxonomy
pub(crate) fn classify_http_error(status: StatusCode, body: &str) -> ChatError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|parsed| parsed.error);

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || detail.as_ref().is_some_and(ApiErrorDetail::is_invalid_key)
        || body.contains("API_KEY_INVALID")
    {
        return ChatError::InvalidCredential;
    }

    let message = match detail.and_then(|d| d.message) {
        Some(message) => message,
        None if body.trim().is_empty() => "no response body".to_string(),
        None => body.trim().to_string(),
    };
    ChatError::Communication(format!("HTTP {}: {}", status.as_u16(), message))
}

fn idle_error(idle: Duration) -> ChatError {
    ChatError::Communication(format!("no data received from the model for {:?}", idle))
}

struct SseState<B> {
    body: BoxStream<'static, B>,
    idle: Duration,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ChatError>>,
    finished: bool,
}

/// Decode an SSE byte stream into text fragments.
///
/// The first error ends the stream, and so does a gap of more than `idle`
/// between chunks.
pub(crate) fn sse_fragments<S, C, E>(body: S, idle: Duration) -> FragmentStream
where
    S: Stream<Item = Result<C, E>> + Send + 'static,
    C: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        body: body.boxed(),
        idle,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                    state.finished = true;
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            let next = match tokio::time::timeout(state.idle, state.body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(idle = ?state.idle, "Gemini stream went quiet");
                    state.pending.push_back(Err(idle_error(state.idle)));
                    continue;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    state
                        .buffer
                        .extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    while let Some(end) = find_event_end(&state.buffer) {
                        let event: Vec<u8> = state.buffer.drain(..end + 2).collect();
                        if let Some(item) = decode_event(&event[..end]) {
                            state.pending.push_back(item);
                        }
                    }
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(ChatError::Communication(e.to_string())));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    if let Some(item) = decode_event(&rest) {
                        state.pending.push_back(item);
                    }
                    state.finished = true;
                }
            }
        }
    }))
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Decode one SSE event. `None` for events that carry no text.
fn decode_event(raw: &[u8]) -> Option<Result<String, ChatError>> {
    let text = String::from_utf8_lossy(raw);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return None;
    }
    let data = data.join("\n");
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return None;
    }

    let response: GenerateContentResponse = match serde_json::from_str(&data) {
        Ok(response) => response,
        Err(e) => {
            return Some(Err(ChatError::Communication(format!(
                "invalid stream event: {}",
                e
            ))))
        }
    };

    if let Some(error) = response.error {
        if error.is_invalid_key() {
            return Some(Err(ChatError::InvalidCredential));
        }
        let message = error.message.unwrap_or_else(|| "stream error".to_string());
        return Some(Err(ChatError::Communication(message)));
    }

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Some(Err(ChatError::Communication(format!(
            "the request was blocked ({})",
            reason
        ))));
    }

    let text: String = response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(text.as_str()),
                    Part::InlineData { .. } | Part::Other(_) => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        None
    } else {
        Some(Ok(text))
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub(crate) contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system_instruction: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) parts: Vec<Part>,
}

impl Content {
    pub(crate) fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    pub(crate) fn model(text: impl Into<String>) -> Self {
        Self {
            role: Some("model".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    pub(crate) fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    /// Part kinds this client never sends or renders
    Other(serde_json::Value),
}

impl Part {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub(crate) fn inline(attachment: Attachment) -> Self {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: attachment.mime_type,
                data: attachment.data,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    pub(crate) mime_type: String,
    pub(crate) data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ApiErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorReason {
    #[serde(default)]
    reason: Option<String>,
}

impl ApiErrorDetail {
    fn is_invalid_key(&self) -> bool {
        let reason_matches = self
            .details
            .iter()
            .any(|d| d.reason.as_deref() == Some("API_KEY_INVALID"));
        let message_matches = self.message.as_deref().is_some_and(|m| {
            m.contains("API_KEY_INVALID") || m.contains("API key not valid")
        });
        reason_matches || message_matches || self.status.as_deref() == Some("UNAUTHENTICATED")
    }
}
