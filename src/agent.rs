//! Vision agent orchestration
//!
//! Ties the pieces together behind the operations the front end uses:
//! submit a video (file or URL), ask a follow-up, reset, and observe the
//! transcript and status.
//!
//! # Architecture
//! A turn consists of:
//! - `begin_turn` on the conversation store (rejections return to the caller)
//! - optional video acquisition and encoding
//! - a streaming request through the session's client
//! - fragments applied to the turn, then `complete_turn` or `fail_turn`
//!
//! Everything after `begin_turn` reports failure through the transcript.
//! `reset` bumps an epoch that every running turn watches; a turn that sees
//! it stops consuming its stream, which drops the request.

use crate::client::StreamingClient;
use crate::config::{AnalysisSettings, Config};
use crate::conversation::{ConversationEvent, ConversationStore, Turn, TurnTicket, UiStatus};
use crate::credentials::CredentialProvider;
use crate::encoder::{self, VideoBlob};
use crate::error::ChatError;
use crate::gemini::{ChatBackend, GeminiClient};
use crate::input::{self, VideoFetcher};
use crate::prompts::INITIAL_ANALYSIS_PROMPT;
use crate::session::SessionManager;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// How a started turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    Completed,
    Failed(ChatError),
    /// A reset discarded the turn while it was running
    Abandoned,
}

/// Summary of the video under analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VideoInfo {
    pub(crate) name: String,
    pub(crate) mime_type: String,
    pub(crate) size: u64,
}

struct StartedTurn {
    ticket: TurnTicket,
    /// Subscribed while the turn was begun, so only later resets are seen
    resets: watch::Receiver<u64>,
}

enum PendingVideo {
    Local(Arc<VideoBlob>),
    Remote(Url),
}

struct AgentInner {
    client: StreamingClient,
    store: Mutex<ConversationStore>,
    fetcher: VideoFetcher,
    analysis: AnalysisSettings,
    current_video: Mutex<Option<Arc<VideoBlob>>>,
    resets: watch::Sender<u64>,
}

/// Orchestrates a single analysis conversation.
///
/// Cloning is cheap; clones share the same conversation.
#[derive(Clone)]
pub(crate) struct VisionAgent {
    inner: Arc<AgentInner>,
}

impl VisionAgent {
    /// Build an agent talking to the Gemini API
    pub(crate) fn new(
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let backend = Arc::new(GeminiClient::new(&config.gemini)?);
        Self::with_backend(
            backend,
            credentials,
            &config.gemini.model,
            config.analysis.clone(),
        )
    }

    pub(crate) fn with_backend(
        backend: Arc<dyn ChatBackend>,
        credentials: Arc<dyn CredentialProvider>,
        model: &str,
        analysis: AnalysisSettings,
    ) -> anyhow::Result<Self> {
        let sessions = SessionManager::new(credentials, model);
        let (resets, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(AgentInner {
                client: StreamingClient::new(sessions, backend),
                store: Mutex::new(ConversationStore::new()),
                fetcher: VideoFetcher::new(&analysis)?,
                analysis,
                current_video: Mutex::new(None),
                resets,
            }),
        })
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.store().subscribe()
    }

    pub(crate) fn transcript(&self) -> Vec<Turn> {
        self.store().turns().to_vec()
    }

    pub(crate) fn status(&self) -> UiStatus {
        self.store().status()
    }

    /// Whether follow-up questions are accepted
    pub(crate) fn is_ready(&self) -> bool {
        self.store().is_ready()
    }

    pub(crate) fn current_video(&self) -> Option<VideoInfo> {
        self.video_slot().as_ref().map(|blob| VideoInfo {
            name: blob.name.clone(),
            mime_type: blob.mime_type.clone(),
            size: blob.size,
        })
    }

    /// Start a fresh analysis of a local video file
    #[instrument(skip(self))]
    pub(crate) async fn submit_video_file(&self, path: &Path) -> Result<TurnOutcome, ChatError> {
        let blob = Arc::new(input::video_from_file(path, &self.inner.analysis).await?);
        self.run_turn(INITIAL_ANALYSIS_PROMPT, Some(PendingVideo::Local(blob)))
            .await
    }

    /// Start a fresh analysis of a video behind a direct URL
    #[instrument(skip(self))]
    pub(crate) async fn submit_video_url(&self, raw_url: &str) -> Result<TurnOutcome, ChatError> {
        let url = input::parse_video_url(raw_url)?;
        self.run_turn(INITIAL_ANALYSIS_PROMPT, Some(PendingVideo::Remote(url)))
            .await
    }

    /// Ask a follow-up question about the analysed video
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub(crate) async fn submit_follow_up(&self, text: &str) -> Result<TurnOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("Please enter a message.".to_string()));
        }
        self.run_turn(text, None).await
    }

    /// Discard the transcript, the session and the current video
    pub(crate) fn reset(&self) {
        let mut store = self.store();
        self.reset_locked(&mut store);
        info!("Conversation reset");
    }

    /// Reset while the caller holds the store lock. Turns begin under the
    /// same lock, so a turn either sees this reset's epoch bump or starts
    /// after it.
    fn reset_locked(&self, store: &mut ConversationStore) {
        store.reset();
        self.inner.client.reset_session();
        self.set_current_video(None);
        self.inner.resets.send_modify(|epoch| *epoch += 1);
    }

    /// Claim the in-progress slot. A video starts a fresh conversation; a
    /// follow-up needs a completed analysis and an idle store.
    fn start_turn(
        &self,
        prompt: &str,
        video: Option<&PendingVideo>,
    ) -> Result<StartedTurn, ChatError> {
        let mut store = self.store();
        match video {
            Some(pending) => {
                self.reset_locked(&mut store);
                if let PendingVideo::Local(blob) = pending {
                    self.set_current_video(Some(blob.clone()));
                }
            }
            None => {
                if store.status().is_busy {
                    return Err(ChatError::Busy);
                }
                if !store.is_ready() {
                    return Err(ChatError::Validation(
                        "Please analyze a video before asking follow-up questions.".to_string(),
                    ));
                }
            }
        }

        let ticket = store.begin_turn(prompt, video.is_some())?;
        Ok(StartedTurn {
            ticket,
            resets: self.inner.resets.subscribe(),
        })
    }

    async fn run_turn(
        &self,
        prompt: &str,
        video: Option<PendingVideo>,
    ) -> Result<TurnOutcome, ChatError> {
        let StartedTurn {
            ticket,
            mut resets,
        } = self.start_turn(prompt, video.as_ref())?;

        let result = tokio::select! {
            biased;
            _ = resets.changed() => {
                info!(turn_id = ticket.id(), "Turn abandoned by reset");
                return Ok(TurnOutcome::Abandoned);
            }
            result = self.stream_turn(ticket, prompt, video) => result,
        };

        let mut store = self.store();
        match result {
            Ok(()) => {
                if store.complete_turn(ticket) {
                    Ok(TurnOutcome::Completed)
                } else {
                    Ok(TurnOutcome::Abandoned)
                }
            }
            Err(e) => {
                error!(turn_id = ticket.id(), error = %e, "Turn failed");
                if store.fail_turn(ticket, &e) {
                    Ok(TurnOutcome::Failed(e))
                } else {
                    Ok(TurnOutcome::Abandoned)
                }
            }
        }
    }

    async fn stream_turn(
        &self,
        ticket: TurnTicket,
        prompt: &str,
        video: Option<PendingVideo>,
    ) -> Result<(), ChatError> {
        let attachment = match video {
            None => None,
            Some(pending) => {
                let blob = match pending {
                    PendingVideo::Local(blob) => blob,
                    PendingVideo::Remote(url) => {
                        let blob = Arc::new(self.inner.fetcher.fetch(&url).await?);
                        if !self.adopt_video(ticket, &blob) {
                            debug!(turn_id = ticket.id(), "Discarding download for a reset turn");
                            return Ok(());
                        }
                        blob
                    }
                };
                Some(encoder::encode(&blob).await?)
            }
        };

        let mut fragments = self.inner.client.send_turn(prompt, attachment).await?;
        let mut received = 0usize;
        while let Some(item) = fragments.next().await {
            let fragment = item?;
            received += fragment.len();
            if let Err(e) = self.store().append_fragment(ticket, &fragment) {
                warn!(turn_id = ticket.id(), error = %e, "Dropping stale fragment");
                break;
            }
        }
        debug!(turn_id = ticket.id(), chars = received, "Stream finished");
        Ok(())
    }

    /// Make a downloaded video current, unless the turn was reset meanwhile
    fn adopt_video(&self, ticket: TurnTicket, blob: &Arc<VideoBlob>) -> bool {
        let store = self.store();
        if !store.is_active(ticket) {
            return false;
        }
        self.set_current_video(Some(blob.clone()));
        true
    }

    fn set_current_video(&self, video: Option<Arc<VideoBlob>>) {
        *self.video_slot() = video;
    }

    fn store(&self) -> MutexGuard<'_, ConversationStore> {
        match self.inner.store.lock() {
            Ok(store) => store,
            Err(poisoned) => {
                warn!("Conversation store mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn video_slot(&self) -> MutexGuard<'_, Option<Arc<VideoBlob>>> {
        match self.inner.current_video.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
