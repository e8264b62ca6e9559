//! Conversation transcript state
//!
//! Holds the ordered list of turns and at most one in-progress agent turn
//! that streamed fragments are appended into. UI flags are derived from the
//! active turn rather than stored separately.
//!
//! # Turn tickets
//! `begin_turn` hands out a `TurnTicket`; every later mutation of that turn
//! must present it. Ticket ids are never reused, so fragments from a stream
//! abandoned by `reset` (or superseded by a newer turn) are rejected instead
//! of landing in the wrong slot.

use crate::error::{ChatError, ConversationError};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Speaker {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TurnState {
    InProgress,
    Complete,
}

/// One message in the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Turn {
    pub(crate) speaker: Speaker,
    pub(crate) text: String,
    pub(crate) state: TurnState,
}

/// Proof of ownership of the in-progress turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TurnTicket {
    id: u64,
}

impl TurnTicket {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Derived status for the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct UiStatus {
    /// A request is outstanding
    pub(crate) is_busy: bool,
    /// The outstanding request carries a video (initial analysis)
    pub(crate) is_attaching: bool,
    pub(crate) last_error: Option<String>,
}

/// Change notifications for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConversationEvent {
    TurnStarted { turn_id: u64, has_attachment: bool },
    Fragment { turn_id: u64, text: String },
    TurnCompleted { turn_id: u64 },
    TurnFailed { turn_id: u64, notice: String },
    Reset,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTurn {
    ticket: TurnTicket,
    has_attachment: bool,
}

/// Capacity of the event channel; slow subscribers skip ahead
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct ConversationStore {
    turns: Vec<Turn>,
    active: Option<ActiveTurn>,
    last_error: Option<String>,
    next_turn_id: u64,
    analysis_ready: bool,
    events: broadcast::Sender<ConversationEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            turns: Vec::new(),
            active: None,
            last_error: None,
            next_turn_id: 1,
            analysis_ready: false,
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub(crate) fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub(crate) fn status(&self) -> UiStatus {
        UiStatus {
            is_busy: self.active.is_some(),
            is_attaching: self.active.is_some_and(|a| a.has_attachment),
            last_error: self.last_error.clone(),
        }
    }

    /// True once a video analysis turn has completed successfully
    pub(crate) fn is_ready(&self) -> bool {
        self.analysis_ready
    }

    /// Start a turn: a user message followed by an empty in-progress agent turn.
    ///
    /// With an attachment the transcript is replaced; otherwise the turn is
    /// appended. Fails while another turn is in progress.
    pub(crate) fn begin_turn(
        &mut self,
        user_text: &str,
        has_attachment: bool,
    ) -> Result<TurnTicket, ConversationError> {
        if self.active.is_some() {
            return Err(ConversationError::TurnInProgress);
        }

        if has_attachment {
            self.turns.clear();
            self.analysis_ready = false;
        }
        self.last_error = None;

        self.turns.push(Turn {
            speaker: Speaker::User,
            text: user_text.to_string(),
            state: TurnState::Complete,
        });
        self.turns.push(Turn {
            speaker: Speaker::Agent,
            text: String::new(),
            state: TurnState::InProgress,
        });

        let ticket = TurnTicket {
            id: self.next_turn_id,
        };
        self.next_turn_id += 1;
        self.active = Some(ActiveTurn {
            ticket,
            has_attachment,
        });

        debug!(turn_id = ticket.id, has_attachment, "Turn started");
        self.publish(ConversationEvent::TurnStarted {
            turn_id: ticket.id,
            has_attachment,
        });
        Ok(ticket)
    }

    /// Append a streamed fragment to the in-progress turn owned by `ticket`
    pub(crate) fn append_fragment(
        &mut self,
        ticket: TurnTicket,
        text: &str,
    ) -> Result<(), ConversationError> {
        self.check_active(ticket)?;
        let Some(turn) = self.turns.last_mut() else {
            return Err(ConversationError::NoTurnInProgress);
        };
        turn.text.push_str(text);

        self.publish(ConversationEvent::Fragment {
            turn_id: ticket.id,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Mark the turn complete. Returns `false` (and changes nothing) if the
    /// ticket no longer owns the in-progress slot.
    pub(crate) fn complete_turn(&mut self, ticket: TurnTicket) -> bool {
        let Some(active) = self.active.filter(|a| a.ticket == ticket) else {
            return false;
        };
        if active.has_attachment {
            self.analysis_ready = true;
        }
        self.finish(ticket);
        true
    }

    /// Replace the turn's content with an error notice, record the error and
    /// complete the turn. Returns `false` for a stale ticket.
    pub(crate) fn fail_turn(&mut self, ticket: TurnTicket, error: &ChatError) -> bool {
        if self.check_active(ticket).is_err() {
            warn!(turn_id = ticket.id, error = %error, "Dropping failure for inactive turn");
            return false;
        }

        let notice = error_notice(error);
        if let Some(turn) = self.turns.last_mut() {
            turn.text = notice.clone();
        }
        self.last_error = Some(last_error_message(error));

        self.publish(ConversationEvent::TurnFailed {
            turn_id: ticket.id,
            notice,
        });
        self.finish(ticket);
        true
    }

    /// Clear transcript and status, abandoning any in-progress turn
    pub(crate) fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(turn_id = active.ticket.id, "Abandoning in-progress turn");
        }
        self.turns.clear();
        self.last_error = None;
        self.analysis_ready = false;
        self.publish(ConversationEvent::Reset);
    }

    /// Whether `ticket` still owns the in-progress slot
    pub(crate) fn is_active(&self, ticket: TurnTicket) -> bool {
        self.check_active(ticket).is_ok()
    }

    fn check_active(&self, ticket: TurnTicket) -> Result<(), ConversationError> {
        match self.active {
            None => Err(ConversationError::NoTurnInProgress),
            Some(active) if active.ticket != ticket => {
                Err(ConversationError::StaleTurn(ticket.id))
            }
            Some(_) => Ok(()),
        }
    }

    fn finish(&mut self, ticket: TurnTicket) {
        if let Some(turn) = self.turns.last_mut() {
            turn.state = TurnState::Complete;
        }
        self.active = None;
        debug!(turn_id = ticket.id, "Turn completed");
        self.publish(ConversationEvent::TurnCompleted { turn_id: ticket.id });
    }

    fn publish(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Text written into the agent turn when a turn fails
pub(crate) fn error_notice(error: &ChatError) -> String {
    format!("Sorry, I encountered an error. {}", error)
}

/// Text recorded as the store's last error
pub(crate) fn last_error_message(error: &ChatError) -> String {
    format!(
        "Error: {}. Please check your API key and network connection.",
        error.to_string().trim_end_matches('.')
    )
}
