//! Applying hub frames to the reducer, shared by the live pump and offline
//! replay.

use runwire_core::event::{HubFrame, Normalized, normalize_frame};
use runwire_core::{ApplyOutcome, SessionReducer};
use std::collections::BTreeSet;

/// What one frame did to the reducer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Runs whose state changed
    pub changed_runs: BTreeSet<String>,
    pub events_applied: usize,
    pub events_ignored: usize,
    pub narrations: usize,
    /// Targets the client does not handle
    pub unhandled: Vec<String>,
}

impl FrameReport {
    pub fn merge(&mut self, other: FrameReport) {
        self.changed_runs.extend(other.changed_runs);
        self.events_applied += other.events_applied;
        self.events_ignored += other.events_ignored;
        self.narrations += other.narrations;
        self.unhandled.extend(other.unhandled);
    }
}

/// Normalizes `frame` and applies the result. Unrouted progress frames are
/// addressed to `ctx_run`.
pub fn apply_frame(
    reducer: &mut SessionReducer,
    frame: &HubFrame,
    ctx_run: Option<&str>,
) -> FrameReport {
    let mut report = FrameReport::default();

    for item in normalize_frame(frame, ctx_run) {
        match item {
            Normalized::Event(event) => {
                let run_id = event.run_id().map(str::to_string);
                match reducer.apply_event(event) {
                    ApplyOutcome::Changed => {
                        report.events_applied += 1;
                        report.changed_runs.extend(run_id);
                    }
                    ApplyOutcome::Ignored(reason) => {
                        tracing::debug!("[Replay] event on {:?} ignored: {:?}", run_id, reason);
                        report.events_ignored += 1;
                    }
                }
            }
            Normalized::Narration(narration) => {
                let run_id = narration.run_id.clone();
                if reducer.apply_narration(narration).is_changed() {
                    report.narrations += 1;
                    report.changed_runs.insert(run_id);
                }
            }
            Normalized::Ignored { target } => {
                tracing::debug!("[Replay] unhandled hub target {}", target);
                report.unhandled.push(target);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwire_core::ClientSettings;
    use runwire_core::run::RunState;
    use serde_json::json;

    #[test]
    fn test_apply_frame_routes_events_and_progress() {
        let mut reducer = SessionReducer::new(ClientSettings::default());

        let started = HubFrame::new("event", json!({ "type": "run_started", "runId": "r1" }));
        let report = apply_frame(&mut reducer, &started, None);
        assert_eq!(report.events_applied, 1);
        assert!(report.changed_runs.contains("r1"));

        let file = HubFrame::new("file:created", json!({ "fileName": "out.csv", "sizeBytes": 2048 }));
        let report = apply_frame(&mut reducer, &file, Some("r1"));
        assert_eq!(report.events_applied, 1);
        assert_eq!(report.narrations, 1);

        let done = HubFrame::new("event", json!({ "$type": "RunSucceeded", "runId": "r1" }));
        apply_frame(&mut reducer, &done, None);
        let late = apply_frame(&mut reducer, &done, None);
        assert_eq!(late.events_ignored, 1);
        assert!(late.changed_runs.is_empty());

        let run = reducer.run("r1").unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.artifacts.len(), 1);
    }

    #[test]
    fn test_unknown_target_reported() {
        let mut reducer = SessionReducer::new(ClientSettings::default());
        let report = apply_frame(&mut reducer, &HubFrame::new("presence", json!({})), None);
        assert_eq!(report.unhandled, vec!["presence"]);
    }
}
