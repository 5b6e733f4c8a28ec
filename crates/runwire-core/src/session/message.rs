//! Chat message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents the role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Message from the AI assistant.
    Assistant,
}

/// Where a message's role came from.
///
/// History entries without any role field get a role from
/// [`infer_role`](super::infer_role). That guess is kept distinguishable from
/// a role the server actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoleSource {
    #[default]
    Server,
    Inferred,
}

/// Lifecycle of a single message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Created, no content received yet
    Pending,
    /// Content is still arriving
    Streaming,
    Complete,
    Error,
}

/// One web search hit attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// Attachment information carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_results: Vec<SearchResult>,
}

impl MessageMetadata {
    pub fn with_image(image_url: impl Into<String>) -> Self {
        Self {
            image_url: Some(image_url.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.file_size.is_none()
            && self.image_url.is_none()
            && self.search_results.is_empty()
    }
}

/// A single chat turn.
///
/// `content` is replaced wholesale on every streaming update; the message's
/// position within its session never changes once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub role_source: RoleSource,
}

impl Message {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::complete(id, MessageRole::User, content)
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::complete(id, MessageRole::Assistant, content)
    }

    /// Empty assistant message opened at the start of a streaming turn.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Pending,
            ..Self::complete(id, MessageRole::Assistant, String::new())
        }
    }

    fn complete(id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Complete,
            metadata: None,
            role_source: RoleSource::Server,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = (!metadata.is_empty()).then_some(metadata);
        self
    }
}
