//! Permission gate for tool steps awaiting user approval.
//!
//! The gate never mutates run state. It forwards the user's decision through
//! [`RunCommands`]; the resulting `PermissionGranted` / `PermissionDenied`
//! event comes back through the normal event path and the reducer applies
//! it. Until then the gate remembers that a reply was sent so a second click
//! is not forwarded twice.

use crate::error::Result;
use crate::run::{PermissionDecision, Run, StepState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_DENY_REASON: &str = "Denied by user";

/// Commands addressed to a running agent.
#[async_trait]
pub trait RunCommands: Send + Sync {
    async fn grant(&self, run_id: &str, step_id: &str) -> Result<()>;

    async fn deny(&self, run_id: &str, step_id: &str, reason: &str) -> Result<()>;
}

/// What happened to an approve/deny request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The decision was sent
    Forwarded,
    /// The step is not awaiting permission; nothing was sent
    NotAwaiting,
    /// A decision for this step is already on its way
    AlreadySent,
}

/// A step currently waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPermission {
    pub run_id: String,
    pub step_id: String,
    pub tool: Option<String>,
    pub reason: Option<String>,
    /// A decision was sent and its echo has not arrived yet
    pub reply_sent: bool,
}

pub struct PermissionGate {
    commands: Arc<dyn RunCommands>,
    replied: Mutex<HashSet<(String, String)>>,
}

impl PermissionGate {
    pub fn new(commands: Arc<dyn RunCommands>) -> Self {
        Self {
            commands,
            replied: Mutex::new(HashSet::new()),
        }
    }

    pub async fn approve(&self, run: &Run, step_id: &str) -> Result<GateOutcome> {
        let Some(key) = self.claim(run, step_id).await else {
            return Ok(self.outcome_for(run, step_id).await);
        };
        tracing::info!(run_id = %run.id, "[PermissionGate] Granting step {}", step_id);
        let result = self.commands.grant(&run.id, step_id).await;
        self.settle(key, result).await
    }

    /// Denies the step; `reason` defaults to "Denied by user".
    pub async fn deny(&self, run: &Run, step_id: &str, reason: Option<&str>) -> Result<GateOutcome> {
        let Some(key) = self.claim(run, step_id).await else {
            return Ok(self.outcome_for(run, step_id).await);
        };
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_DENY_REASON);
        tracing::info!(run_id = %run.id, "[PermissionGate] Denying step {}: {}", step_id, reason);
        let result = self.commands.deny(&run.id, step_id, reason).await;
        self.settle(key, result).await
    }

    /// Steps of `run` awaiting permission, in step order.
    pub async fn outstanding(&self, run: &Run) -> Vec<PendingPermission> {
        self.sync(run).await;
        let replied = self.replied.lock().await;
        run.steps
            .iter()
            .filter(|step| step.state == StepState::AwaitingPermission)
            .map(|step| {
                let (tool, reason) = match &step.permission {
                    Some(PermissionDecision::Requested { tool, reason }) => {
                        (tool.clone().or_else(|| step.tool.clone()), reason.clone())
                    }
                    _ => (step.tool.clone(), None),
                };
                PendingPermission {
                    run_id: run.id.clone(),
                    step_id: step.id.clone(),
                    tool,
                    reason,
                    reply_sent: replied.contains(&(run.id.clone(), step.id.clone())),
                }
            })
            .collect()
    }

    /// Forgets replies for steps of `run` that are no longer awaiting
    /// permission. Call after applying events for the run.
    pub async fn sync(&self, run: &Run) {
        let mut replied = self.replied.lock().await;
        replied.retain(|(run_id, step_id)| {
            run_id != &run.id
                || run
                    .step(step_id)
                    .is_some_and(|step| step.state == StepState::AwaitingPermission)
        });
    }

    /// Reserves the step for a reply. `None` when the step is not awaiting
    /// permission or a reply is already outstanding.
    async fn claim(&self, run: &Run, step_id: &str) -> Option<(String, String)> {
        self.sync(run).await;
        let awaiting = run
            .step(step_id)
            .is_some_and(|step| step.state == StepState::AwaitingPermission);
        if !awaiting || run.is_terminal() {
            tracing::debug!(run_id = %run.id, "[PermissionGate] Step {} not awaiting permission", step_id);
            return None;
        }

        let key = (run.id.clone(), step_id.to_string());
        let mut replied = self.replied.lock().await;
        if !replied.insert(key.clone()) {
            tracing::debug!(run_id = %run.id, "[PermissionGate] Reply for {} already sent", step_id);
            return None;
        }
        Some(key)
    }

    async fn outcome_for(&self, run: &Run, step_id: &str) -> GateOutcome {
        let key = (run.id.clone(), step_id.to_string());
        if self.replied.lock().await.contains(&key) {
            GateOutcome::AlreadySent
        } else {
            GateOutcome::NotAwaiting
        }
    }

    async fn settle(&self, key: (String, String), result: Result<()>) -> Result<GateOutcome> {
        match result {
            Ok(()) => Ok(GateOutcome::Forwarded),
            Err(e) => {
                // Let the user try again
                self.replied.lock().await.remove(&key);
                tracing::warn!("[PermissionGate] Reply for {} failed: {}", key.1, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::event::AgentEvent;
    use crate::reducer::SessionReducer;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingCommands {
        calls: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl RunCommands for RecordingCommands {
        async fn grant(&self, run_id: &str, step_id: &str) -> Result<()> {
            if self.fail {
                return Err(ClientError::transport("not connected"));
            }
            self.calls.lock().unwrap().push(format!("Grant({run_id},{step_id})"));
            Ok(())
        }

        async fn deny(&self, run_id: &str, step_id: &str, reason: &str) -> Result<()> {
            if self.fail {
                return Err(ClientError::transport("not connected"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("Deny({run_id},{step_id},{reason})"));
            Ok(())
        }
    }

    fn awaiting_run() -> SessionReducer {
        let mut reducer = SessionReducer::new(Default::default());
        reducer.apply_event(AgentEvent::StepStarted {
            run_id: "r1".into(),
            step_id: "s1".into(),
            tool: Some("shell".into()),
        });
        reducer.apply_event(AgentEvent::PermissionRequested {
            run_id: "r1".into(),
            step_id: "s1".into(),
            tool: Some("shell".into()),
            reason: Some("run ls".into()),
        });
        reducer
    }

    #[tokio::test]
    async fn test_deny_forwards_once_without_mutating_run() {
        let commands = Arc::new(RecordingCommands::default());
        let gate = PermissionGate::new(commands.clone());
        let mut reducer = awaiting_run();
        let run = reducer.run("r1").unwrap().clone();

        assert_eq!(
            gate.deny(&run, "s1", Some("not allowed")).await.unwrap(),
            GateOutcome::Forwarded
        );
        assert_eq!(gate.deny(&run, "s1", None).await.unwrap(), GateOutcome::AlreadySent);
        assert_eq!(gate.approve(&run, "s1").await.unwrap(), GateOutcome::AlreadySent);
        assert_eq!(reducer.run("r1").unwrap(), &run);
        assert!(gate.outstanding(&run).await[0].reply_sent);

        reducer.apply_event(AgentEvent::PermissionDenied {
            run_id: "r1".into(),
            step_id: "s1".into(),
            reason: Some("not allowed".into()),
        });
        let run = reducer.run("r1").unwrap().clone();
        assert!(gate.outstanding(&run).await.is_empty());
        assert_eq!(gate.deny(&run, "s1", None).await.unwrap(), GateOutcome::NotAwaiting);

        assert_eq!(*commands.calls.lock().unwrap(), vec!["Deny(r1,s1,not allowed)"]);
    }

    #[tokio::test]
    async fn test_approve_unknown_step_is_noop() {
        let commands = Arc::new(RecordingCommands::default());
        let gate = PermissionGate::new(commands.clone());
        let run = awaiting_run().run("r1").unwrap().clone();

        assert_eq!(gate.approve(&run, "s9").await.unwrap(), GateOutcome::NotAwaiting);
        assert_eq!(gate.approve(&run, "s1").await.unwrap(), GateOutcome::Forwarded);
        assert_eq!(*commands.calls.lock().unwrap(), vec!["Grant(r1,s1)"]);
    }

    #[tokio::test]
    async fn test_default_deny_reason() {
        let commands = Arc::new(RecordingCommands::default());
        let gate = PermissionGate::new(commands.clone());
        let run = awaiting_run().run("r1").unwrap().clone();

        gate.deny(&run, "s1", Some("  ")).await.unwrap();
        assert_eq!(*commands.calls.lock().unwrap(), vec!["Deny(r1,s1,Denied by user)"]);
    }

    #[tokio::test]
    async fn test_failed_send_can_be_retried() {
        let gate = PermissionGate::new(Arc::new(RecordingCommands {
            fail: true,
            ..Default::default()
        }));
        let run = awaiting_run().run("r1").unwrap().clone();

        assert!(gate.approve(&run, "s1").await.is_err());
        let pending = gate.outstanding(&run).await;
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].reply_sent);
        assert_eq!(pending[0].tool.as_deref(), Some("shell"));
        assert_eq!(pending[0].reason.as_deref(), Some("run ls"));
    }
}
