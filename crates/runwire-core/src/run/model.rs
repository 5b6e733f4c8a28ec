//! Agent run domain model.

use crate::event::Narration;
use serde::{Deserialize, Serialize};

/// Overall run state. `Succeeded` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Started,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Per-step state. `Succeeded` and `Failed` never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Started,
    AwaitingPermission,
    Succeeded,
    Failed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Permission history of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionDecision {
    Requested {
        tool: Option<String>,
        reason: Option<String>,
    },
    Granted,
    /// The user said no. The step carries on; the run is not terminated.
    Denied { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub tool: Option<String>,
    pub state: StepState,
    pub permission: Option<PermissionDecision>,
    /// Tool output summaries in arrival order
    pub outputs: Vec<String>,
    pub failure: Option<String>,
    pub attempt: Option<u32>,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: None,
            state: StepState::Pending,
            permission: None,
            outputs: Vec::new(),
            failure: None,
            attempt: None,
        }
    }

    pub fn was_denied(&self) -> bool {
        matches!(self.permission, Some(PermissionDecision::Denied { .. }))
    }
}

/// A file produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Position in the run state diagram, derived from run and step states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    /// Started, no step currently active
    Idle,
    StepActive(String),
    AwaitingPermission(String),
    Terminal(RunState),
}

/// One agent execution.
///
/// A run may exist before it is bound to a session: push events can arrive
/// before the start request returns. `session_id` is set on attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub session_id: Option<String>,
    pub goal: Option<String>,
    pub state: RunState,
    /// Steps in first-seen order, ids unique
    pub steps: Vec<Step>,
    /// Artifacts in first-seen order, unique by file name
    pub artifacts: Vec<Artifact>,
    pub narration: Vec<Narration>,
    pub failure: Option<String>,
    pub elapsed_minutes: Option<f64>,
}

impl Run {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            goal: None,
            state: RunState::Started,
            steps: Vec::new(),
            artifacts: Vec::new(),
            narration: Vec::new(),
            failure: None,
            elapsed_minutes: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Returns the step, inserting a pending one on first sight.
    pub fn step_entry(&mut self, step_id: &str) -> &mut Step {
        let index = match self.steps.iter().position(|s| s.id == step_id) {
            Some(index) => index,
            None => {
                self.steps.push(Step::new(step_id));
                self.steps.len() - 1
            }
        };
        &mut self.steps[index]
    }

    pub fn artifact(&self, file_name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.file_name == file_name)
    }

    /// Inserts or overwrites by file name. Returns `false` when an identical
    /// entry was already present.
    pub fn upsert_artifact(&mut self, artifact: Artifact) -> bool {
        match self
            .artifacts
            .iter_mut()
            .find(|a| a.file_name == artifact.file_name)
        {
            Some(existing) if *existing == artifact => false,
            Some(existing) => {
                *existing = artifact;
                true
            }
            None => {
                self.artifacts.push(artifact);
                true
            }
        }
    }

    pub fn phase(&self) -> RunPhase {
        if self.is_terminal() {
            return RunPhase::Terminal(self.state);
        }
        if let Some(step) = self
            .steps
            .iter()
            .find(|s| s.state == StepState::AwaitingPermission)
        {
            return RunPhase::AwaitingPermission(step.id.clone());
        }
        match self.steps.iter().rev().find(|s| s.state == StepState::Started) {
            Some(step) => RunPhase::StepActive(step.id.clone()),
            None => RunPhase::Idle,
        }
    }
}
