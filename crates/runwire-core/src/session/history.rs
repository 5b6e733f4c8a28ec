//! Persisted chat history as returned by the backend, and its conversion
//! into [`Message`]s.

use super::message::{Message, MessageMetadata, MessageRole, MessageStatus, RoleSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const USER_ROLE_CODE: i64 = 1;
const INFERRED_USER_MAX_CHARS: usize = 200;
const MARKUP_TOKENS: [&str; 3] = ["##", "```", "**"];

/// One entry of `GET /api/chat/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryEntry {
    pub id: Option<String>,
    pub message_id: Option<String>,
    /// Numeric role code: 1 = user, anything else = assistant
    pub roles: Option<i64>,
    pub role: Option<String>,
    pub content: Option<String>,
    pub created_at: Option<String>,
    pub timestamp: Option<String>,
    pub image_url: Option<String>,
    pub file_name: Option<String>,
    /// Sent as a string or a number depending on backend version
    pub file_size: Option<Value>,
}

impl HistoryEntry {
    /// Resolves the role: numeric `roles` first, then string `role`, then
    /// [`infer_role`].
    pub fn resolve_role(&self) -> (MessageRole, RoleSource) {
        if let Some(code) = self.roles {
            let role = if code == USER_ROLE_CODE {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            return (role, RoleSource::Server);
        }

        if let Some(role) = self.role.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            let role = if role.eq_ignore_ascii_case("user") {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            return (role, RoleSource::Server);
        }

        (
            infer_role(self.content.as_deref().unwrap_or_default()),
            RoleSource::Inferred,
        )
    }

    /// Converts the entry at `index` into a message. Entries without an id
    /// get `history-{index}`.
    pub fn into_message(self, index: usize) -> Message {
        let (role, role_source) = self.resolve_role();
        let id = self
            .id
            .clone()
            .or_else(|| self.message_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("history-{index}"));
        let timestamp = self
            .created_at
            .as_deref()
            .or(self.timestamp.as_deref())
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let metadata = MessageMetadata {
            file_name: self.file_name,
            file_size: self.file_size.as_ref().and_then(value_as_text),
            image_url: self.image_url,
            search_results: Vec::new(),
        };

        Message {
            id,
            role,
            content: self.content.unwrap_or_default(),
            timestamp,
            status: MessageStatus::Complete,
            metadata: None,
            role_source,
        }
        .with_metadata(metadata)
    }
}

/// Guesses a role for a history entry that carries no role information.
///
/// Short plain text (no `##`, triple backticks or `**`, under 200 characters)
/// is taken to be a user message; everything else is assistant output. This
/// is an approximation: callers get [`RoleSource::Inferred`] alongside it and
/// should not treat the result as authoritative.
pub fn infer_role(content: &str) -> MessageRole {
    let has_markup = MARKUP_TOKENS.iter().any(|token| content.contains(token));
    let is_short = content.chars().count() < INFERRED_USER_MAX_CHARS;
    if !has_markup && is_short {
        MessageRole::User
    } else {
        MessageRole::Assistant
    }
}

/// One entry of `GET /api/chat/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSummary {
    pub chat_guid: String,
    pub title: Option<String>,
    pub preview: Option<String>,
    pub updated_at: Option<String>,
}

impl ChatSummary {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled Chat")
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.as_deref().and_then(parse_timestamp)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Backend timestamps sometimes omit the offset
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> HistoryEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_numeric_role_wins() {
        let e = entry(json!({ "roles": 1, "role": "assistant", "content": "## heading" }));
        assert_eq!(e.resolve_role(), (MessageRole::User, RoleSource::Server));

        let e = entry(json!({ "roles": 2, "content": "hi" }));
        assert_eq!(e.resolve_role(), (MessageRole::Assistant, RoleSource::Server));
    }

    #[test]
    fn test_string_role_case_insensitive() {
        let e = entry(json!({ "role": " USER ", "content": "**bold**" }));
        assert_eq!(e.resolve_role(), (MessageRole::User, RoleSource::Server));

        let e = entry(json!({ "role": "", "content": "short" }));
        assert_eq!(e.resolve_role(), (MessageRole::User, RoleSource::Inferred));
    }

    #[test]
    fn test_infer_role() {
        assert_eq!(infer_role("what is rust?"), MessageRole::User);
        assert_eq!(infer_role("## Summary\nok"), MessageRole::Assistant);
        assert_eq!(infer_role("use ```code```"), MessageRole::Assistant);
        assert_eq!(infer_role("a **bold** claim"), MessageRole::Assistant);
        assert_eq!(infer_role(&"x".repeat(199)), MessageRole::User);
        assert_eq!(infer_role(&"x".repeat(200)), MessageRole::Assistant);
    }

    #[test]
    fn test_into_message_ids_and_metadata() {
        let m = entry(json!({
            "roles": 1,
            "content": "see image",
            "createdAt": "2024-05-01T10:00:00Z",
            "imageUrl": "https://cdn/img.png",
            "fileSize": 2048
        }))
        .into_message(3);

        assert_eq!(m.id, "history-3");
        assert_eq!(m.status, MessageStatus::Complete);
        assert_eq!(m.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        let metadata = m.metadata.unwrap();
        assert_eq!(metadata.image_url.as_deref(), Some("https://cdn/img.png"));
        assert_eq!(metadata.file_size.as_deref(), Some("2048"));

        let plain = entry(json!({ "messageId": "m9", "role": "assistant", "content": "ok" }))
            .into_message(0);
        assert_eq!(plain.id, "m9");
        assert!(plain.metadata.is_none());
    }

    #[test]
    fn test_chat_summary_defaults() {
        let summary: ChatSummary =
            serde_json::from_value(json!({ "chatGuid": "c1", "title": "" })).unwrap();
        assert_eq!(summary.display_title(), "Untitled Chat");
        assert!(summary.updated_at().is_none());
    }
}
