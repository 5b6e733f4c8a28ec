//! Canonical push event types.

use crate::run::Artifact;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall time reported with `RunSucceeded`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Elapsed {
    pub total_minutes: f64,
}

/// The one event shape the reducer understands.
///
/// The wire discriminator is `$type`; field names are lower camel case.
/// Anything that cannot be read as one of the known variants becomes
/// [`AgentEvent::Unknown`] carrying the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    RunStarted {
        run_id: String,
        goal: Option<String>,
    },
    PermissionRequested {
        run_id: String,
        step_id: String,
        tool: Option<String>,
        reason: Option<String>,
    },
    PermissionGranted {
        run_id: String,
        step_id: String,
    },
    PermissionDenied {
        run_id: String,
        step_id: String,
        reason: Option<String>,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        tool: Option<String>,
    },
    ToolOutput {
        run_id: String,
        step_id: String,
        #[serde(default)]
        summary: String,
    },
    StepSucceeded {
        run_id: String,
        step_id: String,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        message: Option<String>,
        attempt: Option<u32>,
    },
    RunSucceeded {
        run_id: String,
        elapsed: Option<Elapsed>,
    },
    RunFailed {
        run_id: String,
        message: Option<String>,
    },
    ArtifactCreated {
        run_id: String,
        artifact: Artifact,
    },
    #[serde(skip)]
    Unknown(Value),
}

impl AgentEvent {
    /// Name of the variant, as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RunStarted",
            Self::PermissionRequested { .. } => "PermissionRequested",
            Self::PermissionGranted { .. } => "PermissionGranted",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::StepStarted { .. } => "StepStarted",
            Self::ToolOutput { .. } => "ToolOutput",
            Self::StepSucceeded { .. } => "StepSucceeded",
            Self::StepFailed { .. } => "StepFailed",
            Self::RunSucceeded { .. } => "RunSucceeded",
            Self::RunFailed { .. } => "RunFailed",
            Self::ArtifactCreated { .. } => "ArtifactCreated",
            Self::Unknown(_) => "Unknown",
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PermissionRequested { run_id, .. }
            | Self::PermissionGranted { run_id, .. }
            | Self::PermissionDenied { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::ToolOutput { run_id, .. }
            | Self::StepSucceeded { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::RunSucceeded { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::ArtifactCreated { run_id, .. } => Some(run_id),
            Self::Unknown(_) => None,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::PermissionRequested { step_id, .. }
            | Self::PermissionGranted { step_id, .. }
            | Self::PermissionDenied { step_id, .. }
            | Self::StepStarted { step_id, .. }
            | Self::ToolOutput { step_id, .. }
            | Self::StepSucceeded { step_id, .. }
            | Self::StepFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Free-text progress message keyed by `(run_id, step_id)`.
///
/// `step_id` is a real step id, `PLAN`, `FINAL`, or empty for run-level
/// notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narration {
    pub run_id: String,
    pub step_id: String,
    pub message: String,
}

impl Narration {
    pub const PLAN: &'static str = "PLAN";
    pub const FINAL: &'static str = "FINAL";

    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.step_id == Self::FINAL
    }
}

/// One message received from the push hub: a target name and its
/// invocation arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubFrame {
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl HubFrame {
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            arguments: vec![payload],
        }
    }

    /// First invocation argument, or `null`.
    pub fn payload(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.arguments.first().unwrap_or(&NULL)
    }
}

/// Output of frame normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(AgentEvent),
    Narration(Narration),
    /// Target the client does not listen to
    Ignored { target: String },
}
