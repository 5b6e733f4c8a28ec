//! Agent runs over the push hub.

use crate::SharedReducer;
use crate::replay::{FrameReport, apply_frame};
use runwire_core::event::HubFrame;
use runwire_core::permission::{GateOutcome, PendingPermission, PermissionGate};
use runwire_core::run::Run;
use runwire_core::{ClientError, Result};
use runwire_interaction::{ChatApi, ConnectionManager, HubNotification};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Starts agent runs, feeds hub traffic into the reducer and forwards
/// permission decisions.
pub struct AgentService {
    api: Arc<ChatApi>,
    hub: ConnectionManager,
    reducer: SharedReducer,
    gate: PermissionGate,
}

impl AgentService {
    pub fn new(api: Arc<ChatApi>, hub: ConnectionManager, reducer: SharedReducer) -> Self {
        let gate = PermissionGate::new(Arc::new(hub.clone()));
        Self {
            api,
            hub,
            reducer,
            gate,
        }
    }

    pub fn hub(&self) -> &ConnectionManager {
        &self.hub
    }

    /// Connects the hub and subscribes to every known session.
    pub async fn connect(&self) -> Result<()> {
        self.hub.connect().await?;
        self.resubscribe_all().await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.hub.disconnect().await;
    }

    /// Starts an agent run on `chat_id`, or on a new chat when `None`.
    ///
    /// The goal is appended to the session right away and the session stays
    /// busy until the run finishes. If the start request fails the goal is
    /// removed again and the error returned. Returns the run id.
    pub async fn start_run(&self, chat_id: Option<&str>, goal: &str) -> Result<String> {
        let chat_id = match chat_id {
            Some(id) => id.to_string(),
            None => self.api.create_chat(None).await?,
        };
        self.hub.connect().await?;
        self.reducer.lock().await.begin_run(&chat_id, goal)?;

        match self.launch(&chat_id, goal).await {
            Ok(run_id) => Ok(run_id),
            Err(err) => {
                tracing::warn!("[AgentService] Run start in {} failed: {}", chat_id, err);
                self.reducer.lock().await.abort_run_start(&chat_id);
                Err(err)
            }
        }
    }

    async fn launch(&self, chat_id: &str, goal: &str) -> Result<String> {
        self.hub.subscribe(chat_id).await?;
        let run_id = self.api.start_agent(chat_id, goal).await?;
        self.hub.join(&run_id).await?;
        self.reducer.lock().await.attach_run(chat_id, &run_id)?;
        tracing::info!(run_id = %run_id, "[AgentService] Run started in {}", chat_id);
        Ok(run_id)
    }

    /// Consumes hub notifications until the channel closes or a terminal
    /// error arrives, which is returned.
    pub async fn pump(&self, mut notifications: UnboundedReceiver<HubNotification>) -> Result<()> {
        while let Some(notification) = notifications.recv().await {
            if let Err(err) = self.handle_notification(notification).await {
                if err.is_terminal() {
                    tracing::error!("[AgentService] Hub failed: {}", err);
                    return Err(err);
                }
                tracing::warn!("[AgentService] {}", err);
            }
        }
        Ok(())
    }

    /// Handles one notification. Errors reported by the hub are returned.
    pub async fn handle_notification(&self, notification: HubNotification) -> Result<()> {
        match notification {
            HubNotification::Frame(frame) => {
                self.apply(&frame).await;
                Ok(())
            }
            HubNotification::ConnectionStateChanged(true) => self.resubscribe_all().await,
            HubNotification::ConnectionStateChanged(false) => {
                tracing::warn!("[AgentService] Hub connection lost");
                Ok(())
            }
            HubNotification::Resubscribed(chat_ids) => {
                tracing::info!("[AgentService] Resubscribed to {} chat(s)", chat_ids.len());
                Ok(())
            }
            HubNotification::Error(err) => {
                if err.is_terminal() {
                    self.release_stalled_runs().await;
                }
                Err(err)
            }
        }
    }

    /// Frees sessions whose runs can no longer report completion because
    /// the hub is gone. Messages already received stay in place.
    async fn release_stalled_runs(&self) {
        let released = self.reducer.lock().await.release_attached_runs();
        for (chat_id, run_id) in &released {
            tracing::warn!(run_id = %run_id, "[AgentService] Released {} after hub failure", chat_id);
        }
    }

    /// Applies one frame and clears stale permission replies on the runs
    /// it touched.
    pub async fn apply(&self, frame: &HubFrame) -> FrameReport {
        let ctx_run = self.hub.joined_run().await;
        let (report, runs) = {
            let mut reducer = self.reducer.lock().await;
            let report = apply_frame(&mut reducer, frame, ctx_run.as_deref());
            let runs: Vec<Run> = report
                .changed_runs
                .iter()
                .filter_map(|id| reducer.run(id).cloned())
                .collect();
            (report, runs)
        };
        for run in &runs {
            self.gate.sync(run).await;
        }
        report
    }

    pub async fn approve(&self, run_id: &str, step_id: &str) -> Result<GateOutcome> {
        let run = self.snapshot(run_id).await?;
        self.gate.approve(&run, step_id).await
    }

    pub async fn deny(&self, run_id: &str, step_id: &str, reason: Option<&str>) -> Result<GateOutcome> {
        let run = self.snapshot(run_id).await?;
        self.gate.deny(&run, step_id, reason).await
    }

    /// Steps of the run waiting for a decision.
    pub async fn pending_permissions(&self, run_id: &str) -> Result<Vec<PendingPermission>> {
        let run = self.snapshot(run_id).await?;
        Ok(self.gate.outstanding(&run).await)
    }

    pub async fn run(&self, run_id: &str) -> Option<Run> {
        self.reducer.lock().await.run(run_id).cloned()
    }

    async fn snapshot(&self, run_id: &str) -> Result<Run> {
        self.run(run_id)
            .await
            .ok_or_else(|| ClientError::not_found("run", run_id))
    }

    /// Subscribes to sessions the hub does not already cover.
    async fn resubscribe_all(&self) -> Result<()> {
        let held: BTreeSet<String> = self.hub.subscriptions().await.into_iter().collect();
        let missing: Vec<String> = self
            .reducer
            .lock()
            .await
            .session_ids()
            .into_iter()
            .filter(|id| !held.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let restored = self.hub.restore_subscriptions(missing).await?;
        tracing::debug!("[AgentService] Subscribed to {} session(s)", restored.len());
        Ok(())
    }
}
