//! Adapter table from the shapes the backend has used over time to
//! [`AgentEvent`] and [`Narration`].
//!
//! Normalization is pure: it never touches session or run state and never
//! fails. Payloads that cannot be read come back as
//! [`AgentEvent::Unknown`] or [`Normalized::Ignored`] for the caller to log.

use super::canonical::{AgentEvent, HubFrame, Narration, Normalized};
use serde_json::{Map, Value};

/// Field names that may carry the event discriminator, in priority order.
const DISCRIMINATOR_KEYS: [&str; 4] = ["$type", "type", "eventType", "EventType"];

/// Field aliases applied after re-casing, per event kind: `(alias, canonical)`.
const FIELD_ALIASES: &[(&str, &str, &str)] = &[
    ("StepFailed", "error", "message"),
    ("RunFailed", "error", "message"),
    ("ToolOutput", "output", "summary"),
    ("ArtifactCreated", "name", "fileName"),
    ("ArtifactCreated", "sizeBytes", "size"),
];

const RAW_MODEL_PREVIEW_CHARS: usize = 200;

/// Normalizes one raw event payload.
///
/// `ctx_run` is the currently joined run; it fills in a missing `runId`.
pub fn normalize_event(raw: &Value, ctx_run: Option<&str>) -> AgentEvent {
    let Some(object) = raw.as_object() else {
        return AgentEvent::Unknown(raw.clone());
    };
    let Some(kind) = discriminator(object) else {
        return AgentEvent::Unknown(raw.clone());
    };

    let mut fields = recase_object(object);
    for key in DISCRIMINATOR_KEYS {
        fields.remove(key);
    }
    apply_aliases(&kind, &mut fields);

    if kind == "ArtifactCreated" && !fields.contains_key("artifact") {
        // Flat shape: { fileName, size } at the top level
        let mut artifact = Map::new();
        for key in ["fileName", "size"] {
            if let Some(value) = fields.remove(key) {
                artifact.insert(key.to_string(), value);
            }
        }
        fields.insert("artifact".to_string(), Value::Object(artifact));
    }

    if kind == "RunSucceeded" && !fields.contains_key("elapsed") {
        if let Some(total) = fields.remove("totalMinutes") {
            let mut elapsed = Map::new();
            elapsed.insert("totalMinutes".to_string(), total);
            fields.insert("elapsed".to_string(), Value::Object(elapsed));
        }
    }

    let has_run_id = fields
        .get("runId")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_run_id {
        if let Some(run_id) = ctx_run {
            fields.insert("runId".to_string(), Value::String(run_id.to_string()));
        }
    }

    fields.insert("$type".to_string(), Value::String(kind));
    serde_json::from_value(Value::Object(fields)).unwrap_or_else(|_| AgentEvent::Unknown(raw.clone()))
}

/// Normalizes a narration payload. Missing fields become empty strings; an
/// empty run id is taken from `ctx_run`.
pub fn normalize_narration(raw: &Value, ctx_run: Option<&str>) -> Narration {
    let field = |names: [&str; 2]| {
        names
            .iter()
            .find_map(|name| raw.get(name))
            .map(text_of)
            .unwrap_or_default()
    };

    let mut run_id = field(["runId", "RunId"]);
    if run_id.is_empty() {
        run_id = ctx_run.unwrap_or_default().to_string();
    }
    Narration {
        run_id,
        step_id: field(["stepId", "StepId"]),
        message: field(["message", "Message"]),
    }
}

/// Routes one hub frame by target name.
///
/// Besides the generic `event` and `narration` targets, the agent-events hub
/// sends named progress frames (`tool:start`, `file:created`, ...) that carry
/// no run id; those are addressed to `ctx_run`.
pub fn normalize_frame(frame: &HubFrame, ctx_run: Option<&str>) -> Vec<Normalized> {
    let payload = frame.payload();
    let run_id = ctx_run.unwrap_or_default();
    let narrate = |step_id: String, message: String| {
        Normalized::Narration(Narration::new(run_id, step_id, message))
    };

    match frame.target.as_str() {
        "event" | "Event" => vec![Normalized::Event(normalize_event(payload, ctx_run))],
        "narration" | "Narration" => {
            vec![Normalized::Narration(normalize_narration(payload, ctx_run))]
        }
        "step:start" => {
            let step = field_text(payload, "step");
            vec![narrate(step.clone(), format!("Step {step}: Processing..."))]
        }
        "tool:start" => vec![narrate(
            field_text(payload, "step"),
            format!("Starting {}...", field_text(payload, "tool")),
        )],
        "tool:end" => vec![narrate(
            field_text(payload, "step"),
            format!("{} completed", field_text(payload, "tool")),
        )],
        "raw:model" => {
            let raw_text = field_text(payload, "rawText");
            if raw_text.is_empty() {
                return vec![ignored(frame)];
            }
            let preview: String = raw_text.chars().take(RAW_MODEL_PREVIEW_CHARS).collect();
            let ellipsis = if raw_text.chars().count() > RAW_MODEL_PREVIEW_CHARS {
                "..."
            } else {
                ""
            };
            vec![narrate(String::new(), format!("Model: {preview}{ellipsis}"))]
        }
        "file:created" => file_created(payload, run_id).unwrap_or_else(|| vec![ignored(frame)]),
        "plan:created" => vec![narrate(Narration::PLAN.to_string(), "Plan created".to_string())],
        "plan:updated" => vec![narrate(Narration::PLAN.to_string(), "Plan updated".to_string())],
        "final:answer" => vec![narrate(
            Narration::FINAL.to_string(),
            format!("Agent: {}", field_text(payload, "text")),
        )],
        "timeline:log" => vec![narrate(String::new(), field_text(payload, "message"))],
        _ => vec![ignored(frame)],
    }
}

fn file_created(payload: &Value, run_id: &str) -> Option<Vec<Normalized>> {
    let file_name = ["fileName", "name"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
        .filter(|name| !name.is_empty())?;
    let size = ["sizeBytes", "size"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_u64));

    let mut raw = serde_json::json!({
        "$type": "ArtifactCreated",
        "runId": run_id,
        "artifact": { "fileName": file_name },
    });
    if let Some(size) = size {
        raw["artifact"]["size"] = Value::from(size);
    }

    let message = match size {
        Some(bytes) => format!("Created: {file_name} ({:.1} KB)", bytes as f64 / 1024.0),
        None => format!("Created: {file_name}"),
    };

    Some(vec![
        Normalized::Event(normalize_event(&raw, Some(run_id))),
        Normalized::Narration(Narration::new(run_id, "", message)),
    ])
}

fn ignored(frame: &HubFrame) -> Normalized {
    Normalized::Ignored {
        target: frame.target.clone(),
    }
}

/// Reads the discriminator and brings it to PascalCase
/// (`step_started`, `step-started`, `stepStarted` → `StepStarted`).
fn discriminator(object: &Map<String, Value>) -> Option<String> {
    let raw = DISCRIMINATOR_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|kind| !kind.is_empty())?;

    Some(
        raw.split(['_', '-', '.'])
            .filter(|part| !part.is_empty())
            .map(upper_first)
            .collect(),
    )
}

fn apply_aliases(kind: &str, fields: &mut Map<String, Value>) {
    for (event_kind, alias, canonical) in FIELD_ALIASES {
        if *event_kind == kind && !fields.contains_key(*canonical) {
            if let Some(value) = fields.remove(*alias) {
                fields.insert(canonical.to_string(), value);
            }
        }
    }
}

/// Re-cases every key to lower camel case, recursively.
fn recase_object(object: &Map<String, Value>) -> Map<String, Value> {
    object
        .iter()
        .map(|(key, value)| (lower_camel(key), recase_value(value)))
        .collect()
}

fn recase_value(value: &Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(recase_object(object)),
        Value::Array(items) => Value::Array(items.iter().map(recase_value).collect()),
        other => other.clone(),
    }
}

fn lower_camel(key: &str) -> String {
    if key.starts_with('$') {
        return key.to_string();
    }
    let mut parts = key.split('_').filter(|part| !part.is_empty());
    let Some(first) = parts.next() else {
        return key.to_string();
    };
    let mut out = lower_first(first);
    for part in parts {
        out.push_str(&upper_first(part));
    }
    out
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn field_text(payload: &Value, key: &str) -> String {
    payload.get(key).map(text_of).unwrap_or_default()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
