//! Agent run domain module.

mod model;

pub use model::{Artifact, PermissionDecision, Run, RunPhase, RunState, Step, StepState};
