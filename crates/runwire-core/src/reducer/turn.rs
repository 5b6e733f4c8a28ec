use super::{InFlight, SessionReducer};
use crate::error::{ClientError, Result};
use crate::session::{Message, MessageMetadata, MessageStatus};
use crate::stream::{DeltaAccumulator, StreamDelta};
use uuid::Uuid;

/// What the user sent to open a streaming turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInput {
    pub content: String,
    pub image_url: Option<String>,
    /// Append the user's message before the assistant placeholder
    pub echo_user: bool,
}

impl TurnInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image_url: None,
            echo_user: true,
        }
    }

    pub fn with_image(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    /// A turn that only opens an assistant message (no user echo).
    pub fn continuation() -> Self {
        Self {
            content: String::new(),
            image_url: None,
            echo_user: false,
        }
    }
}

/// Handle for one in-flight streaming turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTicket {
    pub session_id: String,
    /// Id of the assistant message being streamed into
    pub message_id: String,
}

impl SessionReducer {
    /// Opens a streaming turn.
    ///
    /// Appends the user message (unless `input.echo_user` is false) and one
    /// empty assistant message with a synthetic id. Rejected with
    /// `ConcurrentOperationRejected`, appending nothing, while the session
    /// already has an operation in flight.
    pub fn begin_turn(&mut self, session_id: &str, input: TurnInput) -> Result<StreamTicket> {
        self.guard(session_id)?;
        let dedup = self.settings.fragment_dedup;
        let session = self.session_entry(session_id);
        let rollback = session.messages.clone();

        if input.echo_user {
            let mut user = Message::user(format!("user-{}", Uuid::new_v4()), input.content);
            if let Some(image_url) = input.image_url {
                user = user.with_metadata(MessageMetadata::with_image(image_url));
            }
            session.upsert_message(user);
        }

        let message_id = format!("assistant-{}", Uuid::new_v4());
        session.upsert_message(Message::placeholder(message_id.clone()));

        tracing::debug!("[Reducer] Turn started in {} ({})", session_id, message_id);
        self.in_flight.insert(
            session_id.to_string(),
            InFlight::Turn {
                message_id: message_id.clone(),
                accumulator: DeltaAccumulator::new(dedup),
                rollback,
            },
        );

        Ok(StreamTicket {
            session_id: session_id.to_string(),
            message_id,
        })
    }

    /// Applies one decoded delta to the turn's assistant message.
    ///
    /// The message content is overwritten with the full accumulated text.
    /// Returns whether the message changed. Stale tickets are ignored.
    pub fn apply_delta(&mut self, ticket: &StreamTicket, delta: StreamDelta) -> bool {
        let Some(InFlight::Turn {
            message_id,
            accumulator,
            ..
        }) = self.in_flight.get_mut(&ticket.session_id)
        else {
            tracing::debug!("[Reducer] Delta for inactive turn {} dropped", ticket.message_id);
            return false;
        };
        if *message_id != ticket.message_id {
            return false;
        }
        let Some(message) = self
            .sessions
            .get_mut(&ticket.session_id)
            .and_then(|s| s.message_mut(&ticket.message_id))
        else {
            return false;
        };

        match delta {
            StreamDelta::Text(fragment) => {
                if !accumulator.push(&fragment) {
                    return false;
                }
                message.content = accumulator.text().to_string();
                if message.status == MessageStatus::Pending {
                    message.status = MessageStatus::Streaming;
                }
                true
            }
            StreamDelta::SearchResults(results) => {
                let mut metadata = message.metadata.take().unwrap_or_default();
                metadata.search_results = results;
                message.metadata = Some(metadata);
                true
            }
            StreamDelta::Error(error) => {
                tracing::warn!("[Reducer] Stream reported an error: {}", error);
                if accumulator.text().is_empty() {
                    message.content = error;
                }
                message.status = MessageStatus::Error;
                true
            }
            StreamDelta::Status(status) => {
                tracing::debug!("[Reducer] Stream status: {}", status);
                false
            }
            StreamDelta::Ignored => false,
        }
    }

    /// Completes the turn: one trailing newline is trimmed and the message
    /// is marked complete. Releases the session guard.
    pub fn finish_turn(&mut self, ticket: &StreamTicket) -> Result<&Message> {
        let accumulator = match self.in_flight.remove(&ticket.session_id) {
            Some(InFlight::Turn {
                message_id,
                accumulator,
                ..
            }) if message_id == ticket.message_id => accumulator,
            other => {
                if let Some(other) = other {
                    self.in_flight.insert(ticket.session_id.clone(), other);
                }
                return Err(ClientError::not_found("turn", &ticket.message_id));
            }
        };

        let session = self
            .sessions
            .get_mut(&ticket.session_id)
            .ok_or_else(|| ClientError::not_found("session", &ticket.session_id))?;
        session.touch();
        let message = session
            .message_mut(&ticket.message_id)
            .ok_or_else(|| ClientError::not_found("message", &ticket.message_id))?;

        if message.status != MessageStatus::Error {
            message.content = accumulator.finish();
            message.status = MessageStatus::Complete;
        }
        tracing::debug!(
            "[Reducer] Turn finished in {} ({} chars)",
            ticket.session_id,
            message.content.len()
        );
        Ok(message)
    }

    /// Abandons the turn and restores the session's pre-turn messages.
    pub fn fail_turn(&mut self, ticket: &StreamTicket) -> Result<()> {
        let rollback = match self.in_flight.remove(&ticket.session_id) {
            Some(InFlight::Turn {
                message_id,
                rollback,
                ..
            }) if message_id == ticket.message_id => rollback,
            other => {
                if let Some(other) = other {
                    self.in_flight.insert(ticket.session_id.clone(), other);
                }
                return Err(ClientError::not_found("turn", &ticket.message_id));
            }
        };

        if let Some(session) = self.sessions.get_mut(&ticket.session_id) {
            session.messages = rollback;
        }
        tracing::info!("[Reducer] Turn rolled back in {}", ticket.session_id);
        Ok(())
    }
}
