//! Conversation session lifecycle
//!
//! At most one session exists at a time. It is created lazily on the first
//! turn and discarded on reset; a new session starts without any of the
//! previous context, which is how "analyze another video" starts over.

use crate::credentials::{CredentialProvider, GeminiCredentials};
use crate::error::ChatError;
use crate::gemini::Content;
use crate::prompts::SYSTEM_INSTRUCTION;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Accumulated conversational context for one session
#[derive(Debug)]
pub(crate) struct ChatSession {
    pub(crate) id: u64,
    pub(crate) model: String,
    pub(crate) system_instruction: String,
    pub(crate) credentials: GeminiCredentials,
    history: Mutex<Vec<Content>>,
}

impl ChatSession {
    /// Snapshot of the recorded history
    pub(crate) fn history(&self) -> Vec<Content> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => {
                warn!("Session history mutex was poisoned, recovering data");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Record a completed exchange
    pub(crate) fn record_exchange(&self, user: Content, model: Content) {
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push(user);
        history.push(model);
    }
}

/// Owns the single live session
pub(crate) struct SessionManager {
    credentials: Arc<dyn CredentialProvider>,
    model: String,
    created: u64,
    current: Option<Arc<ChatSession>>,
}

impl SessionManager {
    pub(crate) fn new(credentials: Arc<dyn CredentialProvider>, model: impl Into<String>) -> Self {
        Self {
            credentials,
            model: model.into(),
            created: 0,
            current: None,
        }
    }

    /// Return the live session, creating it if there is none.
    ///
    /// Fails with `ChatError::Configuration` when no credential is available.
    pub(crate) fn get_or_create(&mut self) -> Result<Arc<ChatSession>, ChatError> {
        if let Some(session) = &self.current {
            return Ok(session.clone());
        }

        let credentials = self.credentials.credentials()?;
        self.created += 1;
        let session = Arc::new(ChatSession {
            id: self.created,
            model: self.model.clone(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            credentials,
            history: Mutex::new(Vec::new()),
        });
        info!(session_id = session.id, model = %session.model, "Created chat session");

        self.current = Some(session.clone());
        Ok(session)
    }

    /// Discard the live session, if any
    pub(crate) fn reset(&mut self) {
        if let Some(session) = self.current.take() {
            info!(session_id = session.id, "Discarded chat session");
        }
    }

    #[cfg(test)]
    pub(crate) fn has_session(&self) -> bool {
        self.current.is_some()
    }
}
