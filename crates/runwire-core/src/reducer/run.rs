use super::{ApplyOutcome, IgnoreReason, InFlight, SessionReducer};
use crate::error::{ClientError, Result};
use crate::event::{AgentEvent, Narration};
use crate::run::{PermissionDecision, Run, RunState, StepState};
use crate::session::Message;
use uuid::Uuid;

impl SessionReducer {
    /// Opens an agent run for the session: appends the goal as a user
    /// message and takes the session guard until the run is attached and
    /// finishes, or the start is aborted.
    pub fn begin_run(&mut self, session_id: &str, goal: &str) -> Result<()> {
        self.guard(session_id)?;
        let session = self.session_entry(session_id);
        let rollback = session.messages.clone();
        session.upsert_message(Message::user(
            format!("goal-{}", Uuid::new_v4()),
            goal,
        ));

        self.in_flight.insert(
            session_id.to_string(),
            InFlight::RunStart {
                goal: goal.to_string(),
                run_id: None,
                rollback,
            },
        );
        tracing::info!("[Reducer] Run starting in {}", session_id);
        Ok(())
    }

    /// Binds `run_id` to the session once the start request returns.
    ///
    /// Events that arrived before this call already built the run; its
    /// narration is copied into the session now. A run that finished in the
    /// meantime releases the guard immediately.
    pub fn attach_run(&mut self, session_id: &str, run_id: &str) -> Result<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(ClientError::not_found("session", session_id));
        }

        if let Some(bound) = self
            .runs
            .get(run_id)
            .and_then(|run| run.session_id.as_deref())
            .filter(|bound| *bound != session_id)
        {
            return Err(ClientError::internal(format!(
                "run {run_id} is already bound to session {bound}"
            )));
        }

        let goal = match self.in_flight.get_mut(session_id) {
            Some(InFlight::RunStart { goal, run_id: slot, .. }) => {
                *slot = Some(run_id.to_string());
                Some(goal.clone())
            }
            _ => None,
        };

        let run = self.run_entry(run_id);
        run.session_id = Some(session_id.to_string());
        if run.goal.is_none() {
            run.goal = goal;
        }
        let backlog = run.narration.clone();
        let finished = run.is_terminal() || backlog.iter().any(Narration::is_final);

        if let Some(session) = self.sessions.get_mut(session_id) {
            for (index, narration) in backlog.iter().enumerate() {
                session.upsert_message(narration_message(run_id, index, narration));
            }
        }

        tracing::info!("[Reducer] Run {} attached to {}", run_id, session_id);
        if finished {
            self.release_run_guard(session_id, run_id);
        }
        Ok(())
    }

    /// Cancels a run start whose request failed: the goal message is
    /// removed and the guard released. Returns `false` if no run start was
    /// in flight.
    pub fn abort_run_start(&mut self, session_id: &str) -> bool {
        match self.in_flight.remove(session_id) {
            Some(InFlight::RunStart { rollback, .. }) => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.messages = rollback;
                }
                tracing::info!("[Reducer] Run start aborted in {}", session_id);
                true
            }
            Some(other) => {
                self.in_flight.insert(session_id.to_string(), other);
                false
            }
            None => false,
        }
    }

    /// Drops the session guard held by `run_id` without touching messages.
    ///
    /// Used when the run's terminal event can no longer arrive, e.g. after
    /// the hub gave up reconnecting. The goal and narration stay in the
    /// session. Returns `false` if the guard was not held by this run.
    pub fn release_run(&mut self, session_id: &str, run_id: &str) -> bool {
        let released = self.release_run_guard(session_id, run_id);
        if released {
            tracing::info!(run_id = %run_id, "[Reducer] Run released in {}", session_id);
        }
        released
    }

    /// Releases every guard held by an attached run. Returns the
    /// `(session_id, run_id)` pairs that were released.
    pub fn release_attached_runs(&mut self) -> Vec<(String, String)> {
        let held: Vec<(String, String)> = self
            .in_flight
            .iter()
            .filter_map(|(session_id, op)| match op {
                InFlight::RunStart { run_id: Some(run_id), .. } => {
                    Some((session_id.clone(), run_id.clone()))
                }
                _ => None,
            })
            .collect();
        for (session_id, run_id) in &held {
            self.release_run(session_id, run_id);
        }
        held
    }

    pub fn run(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id)
    }

    /// Runs bound to the session, in first-seen order.
    pub fn runs_for(&self, session_id: &str) -> Vec<&Run> {
        self.run_order
            .iter()
            .filter_map(|id| self.runs.get(id))
            .filter(|run| run.session_id.as_deref() == Some(session_id))
            .collect()
    }

    /// Applies one canonical event.
    ///
    /// Events for a finished run and regressions of a finished step are
    /// absorbed without change. Malformed and unknown events are logged and
    /// dropped; they never stop later events from being applied.
    pub fn apply_event(&mut self, event: AgentEvent) -> ApplyOutcome {
        if let AgentEvent::Unknown(raw) = &event {
            tracing::warn!("[Reducer] Dropping unrecognized event: {}", raw);
            return ApplyOutcome::Ignored(IgnoreReason::Unknown);
        }

        let Some(run_id) = event.run_id().filter(|id| !id.is_empty()).map(str::to_string) else {
            tracing::warn!("[Reducer] Dropping {} without runId", event.kind());
            return ApplyOutcome::Ignored(IgnoreReason::Malformed);
        };
        if event.step_id().is_some_and(str::is_empty) {
            tracing::warn!(run_id = %run_id, "[Reducer] Dropping {} without stepId", event.kind());
            return ApplyOutcome::Ignored(IgnoreReason::Malformed);
        }

        let is_new = !self.runs.contains_key(&run_id);
        let run = self.run_entry(&run_id);
        if run.is_terminal() {
            tracing::debug!(
                run_id = %run_id,
                "[Reducer] Run is terminal, absorbing {}",
                event.kind()
            );
            return ApplyOutcome::Ignored(IgnoreReason::TerminalRun);
        }

        let kind = event.kind();
        let outcome = transition(run, event, is_new);
        match outcome {
            ApplyOutcome::Changed => tracing::debug!(run_id = %run_id, "[Reducer] Applied {}", kind),
            ApplyOutcome::Ignored(reason) => {
                tracing::debug!(run_id = %run_id, "[Reducer] Ignored {} ({:?})", kind, reason)
            }
        }

        let run = &self.runs[&run_id];
        if run.is_terminal() {
            tracing::info!(run_id = %run_id, "[Reducer] Run finished: {:?}", run.state);
            if let Some(session_id) = run.session_id.clone() {
                self.release_run_guard(&session_id, &run_id);
            }
        }
        outcome
    }

    /// Records narration on its run and, once the run is bound, appends it
    /// to the session as an assistant message. `FINAL` narration releases
    /// the session guard.
    pub fn apply_narration(&mut self, narration: Narration) -> ApplyOutcome {
        if narration.run_id.is_empty() || narration.message.trim().is_empty() {
            tracing::warn!("[Reducer] Dropping narration without runId or message");
            return ApplyOutcome::Ignored(IgnoreReason::Malformed);
        }

        let run_id = narration.run_id.clone();
        let run = self.run_entry(&run_id);
        if run.narration.contains(&narration) {
            return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
        }

        let index = run.narration.len();
        run.narration.push(narration.clone());
        let session_id = run.session_id.clone();

        if let Some(session_id) = session_id {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.upsert_message(narration_message(&run_id, index, &narration));
            }
            if narration.is_final() {
                self.release_run_guard(&session_id, &run_id);
            }
        }
        ApplyOutcome::Changed
    }

    fn run_entry(&mut self, run_id: &str) -> &mut Run {
        if !self.runs.contains_key(run_id) {
            tracing::debug!(run_id = %run_id, "[Reducer] Tracking new run");
            self.run_order.push(run_id.to_string());
        }
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| Run::new(run_id))
    }

    /// Releases the session guard if it is held by the start of `run_id`.
    fn release_run_guard(&mut self, session_id: &str, run_id: &str) -> bool {
        let held_by_run = matches!(
            self.in_flight.get(session_id),
            Some(InFlight::RunStart { run_id: Some(id), .. }) if id == run_id
        );
        if held_by_run {
            self.in_flight.remove(session_id);
            tracing::debug!("[Reducer] Guard released for {}", session_id);
        }
        held_by_run
    }
}

fn narration_message(run_id: &str, index: usize, narration: &Narration) -> Message {
    Message::assistant(format!("narration-{run_id}-{index}"), narration.message.clone())
}

/// The per-run state machine.
fn transition(run: &mut Run, event: AgentEvent, is_new: bool) -> ApplyOutcome {
    let created = if is_new {
        ApplyOutcome::Changed
    } else {
        ApplyOutcome::Ignored(IgnoreReason::Duplicate)
    };

    match event {
        AgentEvent::RunStarted { goal, .. } => match goal {
            Some(goal) if run.goal.is_none() => {
                run.goal = Some(goal);
                ApplyOutcome::Changed
            }
            _ => created,
        },

        AgentEvent::StepStarted { step_id, tool, .. } => {
            let step = run.step_entry(&step_id);
            if step.state.is_terminal() {
                return ApplyOutcome::Ignored(IgnoreReason::TerminalStep);
            }
            let mut changed = false;
            if step.tool.is_none() && tool.is_some() {
                step.tool = tool;
                changed = true;
            }
            if step.state == StepState::Pending {
                step.state = StepState::Started;
                changed = true;
            }
            changed_or_duplicate(changed)
        }

        AgentEvent::PermissionRequested {
            step_id,
            tool,
            reason,
            ..
        } => {
            let step = run.step_entry(&step_id);
            if step.state.is_terminal() {
                return ApplyOutcome::Ignored(IgnoreReason::TerminalStep);
            }
            let request = PermissionDecision::Requested {
                tool: tool.clone(),
                reason,
            };
            if step.state == StepState::AwaitingPermission && step.permission.as_ref() == Some(&request) {
                return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
            }
            if step.tool.is_none() {
                step.tool = tool;
            }
            step.state = StepState::AwaitingPermission;
            step.permission = Some(request);
            ApplyOutcome::Changed
        }

        AgentEvent::PermissionGranted { step_id, .. } => {
            let step = run.step_entry(&step_id);
            if step.state.is_terminal() {
                return ApplyOutcome::Ignored(IgnoreReason::TerminalStep);
            }
            if step.permission == Some(PermissionDecision::Granted) {
                return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
            }
            step.state = StepState::Started;
            step.permission = Some(PermissionDecision::Granted);
            ApplyOutcome::Changed
        }

        AgentEvent::PermissionDenied { step_id, reason, .. } => {
            let step = run.step_entry(&step_id);
            if step.state.is_terminal() {
                return ApplyOutcome::Ignored(IgnoreReason::TerminalStep);
            }
            if step.was_denied() {
                return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
            }
            // The run carries on; only the step records the refusal.
            step.state = StepState::Started;
            step.permission = Some(PermissionDecision::Denied { reason });
            ApplyOutcome::Changed
        }

        AgentEvent::ToolOutput { step_id, summary, .. } => {
            let step = run.step_entry(&step_id);
            if step.state.is_terminal() {
                return ApplyOutcome::Ignored(IgnoreReason::TerminalStep);
            }
            if summary.is_empty() || step.outputs.last() == Some(&summary) {
                return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
            }
            if step.state == StepState::Pending {
                step.state = StepState::Started;
            }
            step.outputs.push(summary);
            ApplyOutcome::Changed
        }

        AgentEvent::StepSucceeded { step_id, .. } => {
            let step = run.step_entry(&step_id);
            match step.state {
                StepState::Succeeded => ApplyOutcome::Ignored(IgnoreReason::Duplicate),
                StepState::Failed => ApplyOutcome::Ignored(IgnoreReason::TerminalStep),
                _ => {
                    step.state = StepState::Succeeded;
                    ApplyOutcome::Changed
                }
            }
        }

        AgentEvent::StepFailed {
            step_id,
            message,
            attempt,
            ..
        } => {
            let step = run.step_entry(&step_id);
            match step.state {
                StepState::Failed => ApplyOutcome::Ignored(IgnoreReason::Duplicate),
                StepState::Succeeded => ApplyOutcome::Ignored(IgnoreReason::TerminalStep),
                _ => {
                    step.state = StepState::Failed;
                    step.failure = message;
                    step.attempt = attempt;
                    ApplyOutcome::Changed
                }
            }
        }

        AgentEvent::RunSucceeded { elapsed, .. } => {
            run.state = RunState::Succeeded;
            run.elapsed_minutes = elapsed.map(|e| e.total_minutes);
            ApplyOutcome::Changed
        }

        AgentEvent::RunFailed { message, .. } => {
            run.state = RunState::Failed;
            run.failure = message;
            ApplyOutcome::Changed
        }

        AgentEvent::ArtifactCreated { artifact, .. } => {
            if artifact.file_name.trim().is_empty() {
                return ApplyOutcome::Ignored(IgnoreReason::Malformed);
            }
            changed_or_duplicate(run.upsert_artifact(artifact))
        }

        AgentEvent::Unknown(_) => ApplyOutcome::Ignored(IgnoreReason::Unknown),
    }
}

fn changed_or_duplicate(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Changed
    } else {
        ApplyOutcome::Ignored(IgnoreReason::Duplicate)
    }
}
