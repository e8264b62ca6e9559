//! Turn-level request client
//!
//! Combines the session manager and the remote backend: one call per turn,
//! carrying the optional video attachment followed by the prompt text. The
//! session handle never leaves this module.

use crate::encoder::Attachment;
use crate::error::ChatError;
use crate::gemini::{ChatBackend, Content, FragmentStream, GenerateContentRequest, Part, TurnRequest};
use crate::session::{ChatSession, SessionManager};
use futures_util::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

pub(crate) struct StreamingClient {
    sessions: Mutex<SessionManager>,
    backend: Arc<dyn ChatBackend>,
}

impl StreamingClient {
    pub(crate) fn new(sessions: SessionManager, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            sessions: Mutex::new(sessions),
            backend,
        }
    }

    /// Discard the current session so the next turn starts without context
    pub(crate) fn reset_session(&self) {
        self.with_sessions(SessionManager::reset);
    }

    /// Send one turn and return its fragments.
    ///
    /// A missing credential fails here, before any network attempt.
    #[instrument(skip(self, prompt, attachment), fields(has_attachment = attachment.is_some()))]
    pub(crate) async fn send_turn(
        &self,
        prompt: &str,
        attachment: Option<Attachment>,
    ) -> Result<FragmentStream, ChatError> {
        let session = self.with_sessions(SessionManager::get_or_create)?;

        let mut parts = Vec::with_capacity(2);
        if let Some(attachment) = attachment {
            parts.push(Part::inline(attachment));
        }
        parts.push(Part::text(prompt));
        let message = Content::user(parts);

        let mut contents = session.history();
        contents.push(message.clone());

        let request = TurnRequest {
            model: session.model.clone(),
            credentials: session.credentials.clone(),
            body: GenerateContentRequest {
                contents,
                system_instruction: Some(Content::system(session.system_instruction.clone())),
            },
        };

        info!(session_id = session.id, "Sending turn");
        let fragments = self.backend.stream_generate(request).await?;
        Ok(record_on_completion(fragments, session, message))
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut SessionManager) -> T) -> T {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => {
                warn!("Session manager mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut sessions)
    }
}

struct Recording {
    inner: FragmentStream,
    session: Arc<ChatSession>,
    message: Content,
    reply: String,
}

/// Pass fragments through and append the exchange to the originating
/// session's history once the stream is exhausted without error.
fn record_on_completion(
    inner: FragmentStream,
    session: Arc<ChatSession>,
    message: Content,
) -> FragmentStream {
    let state = Some(Recording {
        inner,
        session,
        message,
        reply: String::new(),
    });

    Box::pin(stream::unfold(state, |state| async move {
        let mut recording = state?;
        match recording.inner.next().await {
            Some(Ok(fragment)) => {
                recording.reply.push_str(&fragment);
                Some((Ok(fragment), Some(recording)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                let Recording {
                    session,
                    message,
                    reply,
                    ..
                } = recording;
                session.record_exchange(message, Content::model(reply));
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::testing::ScriptedBackend;

    fn client(backend: Arc<ScriptedBackend>) -> StreamingClient {
        let sessions = SessionManager::new(Arc::new(StaticCredentials::new("key")), "gemini-test");
        StreamingClient::new(sessions, backend)
    }

    async fn drain(stream: FragmentStream) -> Vec<Result<String, ChatError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_attachment_precedes_prompt() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(vec![Ok("ok".to_string())]);
        let client = client(backend.clone());

        let attachment = Attachment {
            data: "AAAA".to_string(),
            mime_type: "video/mp4".to_string(),
        };
        drain(client.send_turn("analyze", Some(attachment)).await.unwrap()).await;

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        let parts = &requests[0].contents.last().unwrap().parts;
        assert!(matches!(&parts[0], Part::InlineData { inline_data } if inline_data.mime_type == "video/mp4"));
        assert_eq!(parts[1], Part::text("analyze"));
        assert!(requests[0].system_instruction.is_some());
    }

    #[tokio::test]
    async fn test_follow_up_carries_history() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(vec![Ok("Here is".to_string()), Ok(" it".to_string())]);
        backend.push_reply(vec![Ok("Sure".to_string())]);
        let client = client(backend.clone());

        drain(client.send_turn("first", None).await.unwrap()).await;
        drain(client.send_turn("second", None).await.unwrap()).await;

        let requests = backend.requests();
        let contents = &requests[1].contents;
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0], Content::user(vec![Part::text("first")]));
        assert_eq!(contents[1], Content::model("Here is it"));
        assert_eq!(contents[2], Content::user(vec![Part::text("second")]));
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_recorded() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(vec![
            Ok("Partial".to_string()),
            Err(ChatError::Communication("boom".to_string())),
        ]);
        backend.push_reply(vec![Ok("fine".to_string())]);
        let client = client(backend.clone());

        let items = drain(client.send_turn("first", None).await.unwrap()).await;
        assert!(items[1].is_err());
        drain(client.send_turn("retry", None).await.unwrap()).await;

        let requests = backend.requests();
        assert_eq!(requests[1].contents.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_session_drops_context() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_reply(vec![Ok("one".to_string())]);
        backend.push_reply(vec![Ok("two".to_string())]);
        let client = client(backend.clone());

        drain(client.send_turn("first", None).await.unwrap()).await;
        client.reset_session();
        drain(client.send_turn("again", None).await.unwrap()).await;

        assert_eq!(backend.requests()[1].contents.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_skips_backend() {
        let backend = Arc::new(ScriptedBackend::new());
        let sessions = SessionManager::new(Arc::new(StaticCredentials::missing()), "gemini-test");
        let client = StreamingClient::new(sessions, backend.clone());

        let result = client.send_turn("hello", None).await;
        assert!(matches!(result, Err(ChatError::Configuration(_))));
        assert!(backend.requests().is_empty());
    }
}
