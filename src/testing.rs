//! Scripted backend for exercising turns without a network.

use crate::error::ChatError;
use crate::gemini::{ChatBackend, FragmentStream, GenerateContentRequest, TurnRequest};
use async_trait::async_trait;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

enum Reply {
    Fragments(Vec<Result<String, ChatError>>),
    Refuse(ChatError),
    Channel(mpsc::UnboundedReceiver<Result<String, ChatError>>),
}

/// Replays queued replies in order and records every request it receives.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerateContentRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_reply(&self, fragments: Vec<Result<String, ChatError>>) {
        self.replies.lock().unwrap().push_back(Reply::Fragments(fragments));
    }

    /// Fail the call itself, before any fragment
    pub(crate) fn push_refusal(&self, error: ChatError) {
        self.replies.lock().unwrap().push_back(Reply::Refuse(error));
    }

    /// Reply with a stream the test feeds by hand; dropping the sender ends it
    pub(crate) fn push_channel(&self) -> mpsc::UnboundedSender<Result<String, ChatError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies.lock().unwrap().push_back(Reply::Channel(rx));
        tx
    }

    pub(crate) fn requests(&self) -> Vec<GenerateContentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn stream_generate(&self, request: TurnRequest) -> Result<FragmentStream, ChatError> {
        self.requests.lock().unwrap().push(request.body);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Fragments(Vec::new()));

        match reply {
            Reply::Fragments(items) => Ok(Box::pin(stream::iter(items))),
            Reply::Refuse(error) => Err(error),
            Reply::Channel(rx) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
        }
    }
}
