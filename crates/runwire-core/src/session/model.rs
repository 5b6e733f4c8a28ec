//! Session domain model.

use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One logical conversation.
///
/// Messages are kept in insertion order, which is also chronological order.
/// `updated_at` is used for list sorting only, never for conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Server-issued chat identifier
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Inserts `message` or replaces the message with the same id in place.
    ///
    /// Returns `true` when the message was newly appended.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        self.updated_at = Utc::now();
        match self.message_mut(&message.id) {
            Some(existing) => {
                *existing = message;
                false
            }
            None => {
                self.messages.push(message);
                true
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_position() {
        let mut session = Session::new("c1", "Chat");
        assert!(session.upsert_message(Message::user("m1", "hi")));
        assert!(session.upsert_message(Message::assistant("m2", "hello")));
        assert!(!session.upsert_message(Message::user("m1", "hi again")));

        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].id, "m1");
        assert_eq!(session.messages[0].content, "hi again");
        assert_eq!(session.messages[1].id, "m2");
    }
}
