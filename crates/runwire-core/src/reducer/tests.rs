use super::*;
use crate::event::{AgentEvent, Elapsed, Narration, normalize_event};
use crate::run::{Artifact, PermissionDecision, RunPhase, RunState, StepState};
use crate::session::{MessageRole, MessageStatus, RoleSource};
use crate::stream::{FragmentDedup, SseDecoder, StreamDelta};
use serde_json::json;

fn reducer() -> SessionReducer {
    SessionReducer::new(ClientSettings::default())
}

fn text(s: &str) -> StreamDelta {
    StreamDelta::Text(s.to_string())
}

fn step_started(run: &str, step: &str, tool: &str) -> AgentEvent {
    AgentEvent::StepStarted {
        run_id: run.into(),
        step_id: step.into(),
        tool: Some(tool.into()),
    }
}

fn step_succeeded(run: &str, step: &str) -> AgentEvent {
    AgentEvent::StepSucceeded {
        run_id: run.into(),
        step_id: step.into(),
    }
}

fn step_failed(run: &str, step: &str) -> AgentEvent {
    AgentEvent::StepFailed {
        run_id: run.into(),
        step_id: step.into(),
        message: Some("boom".into()),
        attempt: Some(1),
    }
}

fn artifact(run: &str, name: &str, size: u64) -> AgentEvent {
    AgentEvent::ArtifactCreated {
        run_id: run.into(),
        artifact: Artifact {
            file_name: name.into(),
            size: Some(size),
        },
    }
}

fn run_succeeded(run: &str) -> AgentEvent {
    AgentEvent::RunSucceeded {
        run_id: run.into(),
        elapsed: Some(Elapsed { total_minutes: 0.5 }),
    }
}

// ============================================================================
// Streaming turns
// ============================================================================

#[test]
fn test_turn_streams_full_text_into_one_message() {
    let mut r = reducer();
    r.create_session("c1", "Chat");
    let ticket = r.begin_turn("c1", TurnInput::new("hi")).unwrap();

    let session = r.session("c1").unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, MessageRole::User);
    assert_eq!(session.messages[1].status, MessageStatus::Pending);
    assert!(session.messages[1].content.is_empty());

    assert!(r.apply_delta(&ticket, text("Hello")));
    assert!(!r.apply_delta(&ticket, text("Hello")));
    assert!(r.apply_delta(&ticket, text(" there\n")));

    let streaming = r.session("c1").unwrap().message(&ticket.message_id).unwrap();
    assert_eq!(streaming.content, "Hello there\n");
    assert_eq!(streaming.status, MessageStatus::Streaming);

    let finished = r.finish_turn(&ticket).unwrap();
    assert_eq!(finished.content, "Hello there");
    assert_eq!(finished.status, MessageStatus::Complete);
    assert!(!r.is_busy("c1"));
}

#[test]
fn test_sse_bytes_through_reducer() {
    let mut r = reducer();
    let ticket = r.begin_turn("c1", TurnInput::new("q")).unwrap();
    let mut decoder = SseDecoder::new();

    for chunk in ["data: {\"content\":\"Hel", "lo\"}\n\ndata:  world\n", "\ndata: [DONE]\n\n"] {
        for delta in decoder.push_bytes(chunk.as_bytes()) {
            r.apply_delta(&ticket, delta);
        }
    }
    assert!(decoder.is_done());
    assert_eq!(r.finish_turn(&ticket).unwrap().content, "Hello world");
}

#[test]
fn test_concurrency_guard_rejects_second_send() {
    let mut r = reducer();
    let _first = r.begin_turn("c1", TurnInput::new("one")).unwrap();
    let before = r.session("c1").unwrap().messages.len();

    let err = r.begin_turn("c1", TurnInput::new("two")).unwrap_err();
    assert!(matches!(err, ClientError::ConcurrentOperationRejected { .. }));
    assert!(err.is_retryable());
    assert_eq!(r.session("c1").unwrap().messages.len(), before);

    let err = r.begin_run("c1", "goal").unwrap_err();
    assert!(matches!(err, ClientError::ConcurrentOperationRejected { .. }));
    assert_eq!(r.session("c1").unwrap().messages.len(), before);

    // other sessions are independent
    assert!(r.begin_turn("c2", TurnInput::new("three")).is_ok());
}

#[test]
fn test_fail_turn_restores_previous_messages() {
    let mut r = reducer();
    let first = r.begin_turn("c1", TurnInput::new("one")).unwrap();
    r.apply_delta(&first, text("answer"));
    r.finish_turn(&first).unwrap();
    let snapshot = r.session("c1").unwrap().messages.clone();

    let second = r.begin_turn("c1", TurnInput::new("two")).unwrap();
    r.apply_delta(&second, text("partial"));
    r.fail_turn(&second).unwrap();

    assert_eq!(r.session("c1").unwrap().messages, snapshot);
    assert!(!r.is_busy("c1"));
    assert!(!r.apply_delta(&second, text("late")));
    assert!(r.finish_turn(&second).is_err());
}

#[test]
fn test_search_results_and_continuation() {
    let mut r = reducer();
    let ticket = r.begin_turn("c1", TurnInput::continuation()).unwrap();
    assert_eq!(r.session("c1").unwrap().messages.len(), 1);

    let results = vec![crate::session::SearchResult {
        url: "https://a".into(),
        title: "A".into(),
        snippet: String::new(),
    }];
    assert!(r.apply_delta(&ticket, StreamDelta::SearchResults(results.clone())));
    assert!(!r.apply_delta(&ticket, StreamDelta::Status("searching".into())));
    r.apply_delta(&ticket, text("summary"));

    let message = r.finish_turn(&ticket).unwrap();
    assert_eq!(message.metadata.as_ref().unwrap().search_results, results);
}

#[test]
fn test_in_band_error_marks_message() {
    let mut r = reducer();
    let ticket = r.begin_turn("c1", TurnInput::new("q")).unwrap();
    r.apply_delta(&ticket, StreamDelta::Error("quota exceeded".into()));
    let message = r.finish_turn(&ticket).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.content, "quota exceeded");
}

#[test]
fn test_dedup_mode_comes_from_settings() {
    let settings = ClientSettings {
        fragment_dedup: FragmentDedup::Off,
        ..ClientSettings::default()
    };
    let mut r = SessionReducer::new(settings);
    let ticket = r.begin_turn("c1", TurnInput::new("q")).unwrap();
    r.apply_delta(&ticket, text("ha"));
    r.apply_delta(&ticket, text("ha"));
    assert_eq!(r.finish_turn(&ticket).unwrap().content, "haha");
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn test_load_history_and_recency() {
    let mut r = reducer();
    let entries: Vec<HistoryEntry> = serde_json::from_value(json!([
        { "id": "m1", "roles": 1, "content": "hello" },
        { "id": "m2", "content": "## Answer\nhi" },
        { "id": "m1", "roles": 1, "content": "hello (edited)" }
    ]))
    .unwrap();

    let session = r.load_history("c1", "First", entries).unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "hello (edited)");
    assert_eq!(session.messages[1].role, MessageRole::Assistant);
    assert_eq!(session.messages[1].role_source, RoleSource::Inferred);

    r.create_session("c2", "Second");
    r.rename_session("c1", "Renamed").unwrap();
    let ids: Vec<_> = r.sessions_by_recency().iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, ["c1", "c2"]);
    assert!(r.rename_session("missing", "x").unwrap_err().is_not_found());
}

#[test]
fn test_load_history_rejected_while_streaming() {
    let mut r = reducer();
    let _ticket = r.begin_turn("c1", TurnInput::new("q")).unwrap();
    assert!(r.load_history("c1", "t", Vec::new()).is_err());
}

#[test]
fn test_remove_session_drops_bound_runs_only() {
    let mut r = reducer();
    r.create_session("c1", "one");
    r.create_session("c2", "two");
    r.attach_run("c1", "r1").unwrap();
    r.attach_run("c2", "r2").unwrap();

    assert!(r.remove_session("c1").is_some());
    assert!(r.session("c1").is_none());
    assert!(r.run("r1").is_none());
    assert_eq!(r.runs_for("c2").len(), 1);
    assert_eq!(r.session_ids(), ["c2"]);
}

// ============================================================================
// Runs
// ============================================================================

#[test]
fn test_artifact_upsert_is_idempotent() {
    let mut r = reducer();
    assert!(r.apply_event(artifact("r1", "a.pdf", 10)).is_changed());
    assert_eq!(
        r.apply_event(artifact("r1", "a.pdf", 10)),
        ApplyOutcome::Ignored(IgnoreReason::Duplicate)
    );

    let run = r.run("r1").unwrap();
    assert_eq!(run.artifacts, vec![Artifact { file_name: "a.pdf".into(), size: Some(10) }]);
}

#[test]
fn test_terminal_run_absorbs_events() {
    let mut r = reducer();
    r.apply_event(step_started("r1", "s1", "t"));
    r.apply_event(step_succeeded("r1", "s1"));
    r.apply_event(run_succeeded("r1"));
    let snapshot = r.run("r1").unwrap().clone();

    for event in [
        step_started("r1", "s2", "t"),
        step_failed("r1", "s1"),
        artifact("r1", "late.txt", 1),
        AgentEvent::RunFailed {
            run_id: "r1".into(),
            message: None,
        },
    ] {
        assert_eq!(r.apply_event(event), ApplyOutcome::Ignored(IgnoreReason::TerminalRun));
    }
    assert_eq!(r.run("r1").unwrap(), &snapshot);
}

#[test]
fn test_succeeded_step_never_regresses() {
    let mut r = reducer();
    r.apply_event(step_started("r1", "s1", "t"));
    r.apply_event(step_succeeded("r1", "s1"));

    let regressions = [
        step_started("r1", "s1", "t"),
        AgentEvent::PermissionRequested {
            run_id: "r1".into(),
            step_id: "s1".into(),
            tool: None,
            reason: None,
        },
        AgentEvent::PermissionGranted {
            run_id: "r1".into(),
            step_id: "s1".into(),
        },
        step_failed("r1", "s1"),
    ];
    for event in regressions {
        assert!(!r.apply_event(event).is_changed());
        assert_eq!(r.run("r1").unwrap().step("s1").unwrap().state, StepState::Succeeded);
    }
}

#[test]
fn test_step_failure_does_not_end_run() {
    let mut r = reducer();
    r.apply_event(step_started("r1", "s1", "t"));
    r.apply_event(step_failed("r1", "s1"));

    let run = r.run("r1").unwrap();
    assert_eq!(run.state, RunState::Started);
    assert_eq!(run.phase(), RunPhase::Idle);
    let step = run.step("s1").unwrap();
    assert_eq!(step.failure.as_deref(), Some("boom"));
    assert_eq!(step.attempt, Some(1));
}

#[test]
fn test_malformed_and_unknown_events_do_not_poison_stream() {
    let mut r = reducer();
    let unknown = normalize_event(&json!({ "whatever": true }), None);
    assert_eq!(r.apply_event(unknown), ApplyOutcome::Ignored(IgnoreReason::Unknown));
    assert_eq!(
        r.apply_event(step_started("", "s1", "t")),
        ApplyOutcome::Ignored(IgnoreReason::Malformed)
    );
    assert_eq!(
        r.apply_event(step_started("r1", "", "t")),
        ApplyOutcome::Ignored(IgnoreReason::Malformed)
    );
    assert_eq!(
        r.apply_event(artifact("r1", " ", 1)),
        ApplyOutcome::Ignored(IgnoreReason::Malformed)
    );

    assert!(r.apply_event(step_started("r1", "s1", "t")).is_changed());
    assert_eq!(r.run("r1").unwrap().step("s1").unwrap().state, StepState::Started);
}

#[test]
fn test_scenario_summarize_file() {
    let mut r = reducer();
    r.begin_run("c1", "summarize file.pdf").unwrap();
    r.attach_run("c1", "r1").unwrap();

    r.apply_event(AgentEvent::RunStarted {
        run_id: "r1".into(),
        goal: Some("summarize file.pdf".into()),
    });
    r.apply_event(step_started("r1", "s1", "pdf-summarize"));
    r.apply_narration(Narration::new("r1", "s1", "Reading file.pdf"));
    r.apply_event(artifact("r1", "summary.txt", 512));
    assert!(r.is_busy("c1"));
    r.apply_event(run_succeeded("r1"));

    let run = r.run("r1").unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.goal.as_deref(), Some("summarize file.pdf"));
    assert_eq!(run.artifacts, vec![Artifact { file_name: "summary.txt".into(), size: Some(512) }]);
    assert_eq!(run.elapsed_minutes, Some(0.5));

    let session = r.session("c1").unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "summarize file.pdf");
    assert_eq!(session.messages[1].role, MessageRole::Assistant);
    assert_eq!(session.messages[1].content, "Reading file.pdf");
    assert!(!r.is_busy("c1"));
}

#[test]
fn test_scenario_permission_denied_run_continues() {
    let mut r = reducer();
    r.apply_event(step_started("r1", "s1", "shell"));
    r.apply_event(AgentEvent::PermissionRequested {
        run_id: "r1".into(),
        step_id: "s1".into(),
        tool: Some("shell".into()),
        reason: Some("needs rm".into()),
    });
    assert_eq!(r.run("r1").unwrap().phase(), RunPhase::AwaitingPermission("s1".into()));

    let denied = AgentEvent::PermissionDenied {
        run_id: "r1".into(),
        step_id: "s1".into(),
        reason: Some("not allowed".into()),
    };
    assert!(r.apply_event(denied.clone()).is_changed());
    assert_eq!(r.apply_event(denied), ApplyOutcome::Ignored(IgnoreReason::Duplicate));

    let run = r.run("r1").unwrap();
    assert_eq!(run.state, RunState::Started);
    assert_eq!(run.phase(), RunPhase::StepActive("s1".into()));
    let step = run.step("s1").unwrap();
    assert_eq!(
        step.permission,
        Some(PermissionDecision::Denied { reason: Some("not allowed".into()) })
    );

    r.apply_event(AgentEvent::RunFailed {
        run_id: "r1".into(),
        message: Some("user denied shell".into()),
    });
    let run = r.run("r1").unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.as_deref(), Some("user denied shell"));
}

#[test]
fn test_duplicate_step_succeeded_after_replay() {
    let mut r = reducer();
    r.apply_event(step_started("r1", "s1", "t"));
    assert!(r.apply_event(step_succeeded("r1", "s1")).is_changed());
    let snapshot = r.run("r1").unwrap().clone();

    assert_eq!(
        r.apply_event(step_succeeded("r1", "s1")),
        ApplyOutcome::Ignored(IgnoreReason::Duplicate)
    );
    assert_eq!(r.run("r1").unwrap(), &snapshot);
}

#[test]
fn test_events_before_attach_build_unbound_run() {
    let mut r = reducer();
    r.begin_run("c1", "goal").unwrap();
    r.apply_event(step_started("r1", "s1", "t"));
    r.apply_narration(Narration::new("r1", "PLAN", "Plan created"));
    assert!(r.run("r1").unwrap().session_id.is_none());
    assert_eq!(r.session("c1").unwrap().messages.len(), 1);

    r.attach_run("c1", "r1").unwrap();
    let run = r.run("r1").unwrap();
    assert_eq!(run.session_id.as_deref(), Some("c1"));
    assert_eq!(run.goal.as_deref(), Some("goal"));
    assert_eq!(r.session("c1").unwrap().messages.len(), 2);
    assert_eq!(r.runs_for("c1").len(), 1);

    // attaching the same run elsewhere is refused
    r.create_session("c2", "other");
    assert!(r.attach_run("c2", "r1").is_err());
}

#[test]
fn test_final_narration_releases_guard() {
    let mut r = reducer();
    r.begin_run("c1", "goal").unwrap();
    r.attach_run("c1", "r1").unwrap();
    assert!(r.is_busy("c1"));

    let final_answer = Narration::new("r1", Narration::FINAL, "Agent: done");
    assert!(r.apply_narration(final_answer.clone()).is_changed());
    assert!(!r.is_busy("c1"));
    assert_eq!(
        r.apply_narration(final_answer),
        ApplyOutcome::Ignored(IgnoreReason::Duplicate)
    );
    assert_eq!(
        r.apply_narration(Narration::new("", "s1", "x")),
        ApplyOutcome::Ignored(IgnoreReason::Malformed)
    );
}

#[test]
fn test_abort_run_start_rolls_back() {
    let mut r = reducer();
    r.create_session("c1", "Chat");
    r.begin_run("c1", "goal").unwrap();
    assert_eq!(r.session("c1").unwrap().messages.len(), 1);

    assert!(r.abort_run_start("c1"));
    assert!(r.session("c1").unwrap().messages.is_empty());
    assert!(!r.is_busy("c1"));
    assert!(!r.abort_run_start("c1"));
}

#[test]
fn test_release_run_keeps_goal_and_narration() {
    let mut r = reducer();
    r.begin_run("c1", "summarize").unwrap();
    r.attach_run("c1", "r1").unwrap();
    r.apply_event(step_started("r1", "s1", "pdf"));
    r.apply_narration(Narration::new("r1", "s1", "Reading pdf"));

    // the terminal event never arrives
    assert!(r.is_busy("c1"));
    assert!(!r.release_run("c1", "other-run"));
    assert!(r.release_run("c1", "r1"));
    assert!(!r.is_busy("c1"));
    assert_eq!(r.session("c1").unwrap().messages.len(), 2);
    assert!(r.begin_turn("c1", TurnInput::new("next")).is_ok());
}

#[test]
fn test_release_attached_runs_skips_turns_and_pending_starts() {
    let mut r = reducer();
    r.begin_run("c1", "goal").unwrap();
    r.attach_run("c1", "r1").unwrap();
    r.begin_run("c2", "goal").unwrap();
    r.begin_turn("c3", TurnInput::new("hi")).unwrap();

    let released = r.release_attached_runs();
    assert_eq!(released, vec![("c1".to_string(), "r1".to_string())]);
    assert!(!r.is_busy("c1"));
    assert!(r.is_busy("c2"));
    assert!(r.is_busy("c3"));
}
