//! Payload decoding for streamed chat responses.
//!
//! Providers disagree on the shape of a streamed chunk. The decoder tries
//! each known shape in turn and falls back to treating the payload as
//! literal text when it is not JSON at all.

use crate::session::SearchResult;
use serde_json::Value;

/// One decoded unit of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// Text to append to the in-flight assistant message
    Text(String),
    /// Web search results for the in-flight message
    SearchResults(Vec<SearchResult>),
    /// Progress note from the backend; not part of the message body
    Status(String),
    /// In-band error reported by the backend
    Error(String),
    /// Recognized as JSON but carrying nothing usable
    Ignored,
}

/// Decodes a `data:` payload.
///
/// JSON objects, arrays and strings are decoded by shape. Anything that is
/// not JSON, or is a bare JSON scalar, is returned verbatim as text so that
/// leading whitespace survives.
pub fn decode_payload(payload: &str) -> StreamDelta {
    match serde_json::from_str::<Value>(payload.trim()) {
        Ok(Value::String(text)) => StreamDelta::Text(text),
        Ok(value @ (Value::Object(_) | Value::Array(_))) => decode_json(&value),
        Ok(_) | Err(_) => StreamDelta::Text(payload.to_string()),
    }
}

fn decode_json(value: &Value) -> StreamDelta {
    if let Some(delta) = decode_envelope(value) {
        return delta;
    }

    // OpenAI: choices[0].delta.content
    if let Some(text) = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        return StreamDelta::Text(text.to_string());
    }

    // Flat: { "content": "..." }
    if let Some(text) = value.get("content").and_then(Value::as_str) {
        return StreamDelta::Text(text.to_string());
    }

    // Gemini: candidates[0].content.parts[].text, or a flattened content.text
    if let Some(candidate) = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
    {
        if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
            let text: String = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            return if text.is_empty() {
                StreamDelta::Ignored
            } else {
                StreamDelta::Text(text)
            };
        }
        if let Some(text) = candidate.pointer("/content/text").and_then(Value::as_str) {
            return StreamDelta::Text(text.to_string());
        }
    }

    tracing::debug!("[Stream] unrecognized JSON chunk shape: {}", value);
    StreamDelta::Ignored
}

/// Web search envelopes: `{ "type": ..., "data": ... }`.
fn decode_envelope(value: &Value) -> Option<StreamDelta> {
    let kind = value.get("type")?.as_str()?;
    let data = value.get("data");

    let delta = match kind {
        "summary_chunk" => data
            .and_then(Value::as_str)
            .map(|chunk| StreamDelta::Text(chunk.to_string()))
            .unwrap_or(StreamDelta::Ignored),
        "results" => {
            let results = data
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            StreamDelta::SearchResults(results)
        }
        "status" => StreamDelta::Status(data.map(value_text).unwrap_or_default()),
        "error" => StreamDelta::Error(data.map(value_text).unwrap_or_default()),
        _ => return None,
    };
    Some(delta)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> StreamDelta {
        StreamDelta::Text(s.to_string())
    }

    #[test]
    fn test_openai_delta() {
        let payload = r#"{"choices":[{"delta":{"content":" world"}}]}"#;
        assert_eq!(decode_payload(payload), text(" world"));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(decode_payload(role_only), StreamDelta::Ignored);
    }

    #[test]
    fn test_flat_content_and_json_string() {
        assert_eq!(decode_payload(r#"{"content":"hi"}"#), text("hi"));
        assert_eq!(decode_payload(r#""quoted""#), text("quoted"));
    }

    #[test]
    fn test_gemini_parts() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#;
        assert_eq!(decode_payload(payload), text("ab"));

        let flattened = r#"{"candidates":[{"content":{"text":"flat"}}]}"#;
        assert_eq!(decode_payload(flattened), text("flat"));
    }

    #[test]
    fn test_non_json_is_literal_text() {
        assert_eq!(decode_payload(" spaced"), text(" spaced"));
        assert_eq!(decode_payload("{not json"), text("{not json"));
        // bare scalars are text, not a dropped JSON value
        assert_eq!(decode_payload("42"), text("42"));
    }

    #[test]
    fn test_web_search_envelopes() {
        assert_eq!(
            decode_payload(r#"{"type":"summary_chunk","data":"Rust is"}"#),
            text("Rust is")
        );
        assert_eq!(
            decode_payload(r#"{"type":"status","data":"searching"}"#),
            StreamDelta::Status("searching".to_string())
        );
        assert_eq!(
            decode_payload(r#"{"type":"error","data":"quota"}"#),
            StreamDelta::Error("quota".to_string())
        );

        let results = decode_payload(
            r#"{"type":"results","data":[{"url":"https://a","title":"A","snippet":"s"},{"bad":1}]}"#,
        );
        match results {
            StreamDelta::SearchResults(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].url, "https://a");
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_shape_ignored() {
        assert_eq!(decode_payload(r#"{"usage":{"tokens":3}}"#), StreamDelta::Ignored);
    }
}
