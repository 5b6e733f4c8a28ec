//! Offline replay of recorded hub frames.

use anyhow::{Context, Result};
use runwire_application::{FrameReport, apply_frame};
use runwire_core::event::HubFrame;
use runwire_core::run::Run;
use runwire_core::{ClientSettings, SessionReducer};
use std::fmt::Write;
use std::fs;
use std::path::Path;

pub fn replay_file(
    settings: ClientSettings,
    log: &Path,
    ctx_run: Option<&str>,
    session: Option<&str>,
) -> Result<String> {
    let content =
        fs::read_to_string(log).with_context(|| format!("Failed to read {}", log.display()))?;
    replay(settings, &content, ctx_run, session)
}

/// Applies every frame in `content` to a fresh reducer and renders the
/// resulting runs. Lines that are not frames are skipped with a warning.
pub fn replay(
    settings: ClientSettings,
    content: &str,
    ctx_run: Option<&str>,
    session: Option<&str>,
) -> Result<String> {
    let mut reducer = SessionReducer::new(settings);
    let mut report = FrameReport::default();
    let mut skipped = 0usize;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HubFrame>(line) {
            Ok(frame) => report.merge(apply_frame(&mut reducer, &frame, ctx_run)),
            Err(e) => {
                tracing::warn!("[Replay] line {}: not a hub frame: {}", index + 1, e);
                skipped += 1;
            }
        }
    }

    if let Some(session_id) = session {
        reducer.create_session(session_id, "Replay");
        for run_id in &report.changed_runs {
            reducer.attach_run(session_id, run_id)?;
        }
    }

    let mut out = String::new();
    writeln!(
        out,
        "{} event(s) applied, {} ignored, {} narration(s), {} unhandled frame(s), {} bad line(s)",
        report.events_applied,
        report.events_ignored,
        report.narrations,
        report.unhandled.len(),
        skipped
    )?;
    for run_id in &report.changed_runs {
        if let Some(run) = reducer.run(run_id) {
            render_run(&mut out, run)?;
        }
    }
    if let Some(session) = session.and_then(|id| reducer.session(id)) {
        writeln!(out, "session {} ({} message(s))", session.id, session.messages.len())?;
        for message in &session.messages {
            writeln!(out, "  [{:?}] {}", message.role, message.content)?;
        }
    }
    Ok(out)
}

fn render_run(out: &mut String, run: &Run) -> std::fmt::Result {
    writeln!(out, "run {}: {:?}", run.id, run.state)?;
    if let Some(failure) = &run.failure {
        writeln!(out, "  failure: {failure}")?;
    }
    for step in &run.steps {
        let tool = step.tool.as_deref().unwrap_or("-");
        let denied = if step.was_denied() { " (denied)" } else { "" };
        writeln!(out, "  step {} [{}] {:?}{}", step.id, tool, step.state, denied)?;
    }
    for artifact in &run.artifacts {
        match artifact.size {
            Some(size) => writeln!(out, "  artifact {} ({} bytes)", artifact.file_name, size)?,
            None => writeln!(out, "  artifact {}", artifact.file_name)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOG: &str = r#"
{"target":"event","arguments":[{"$type":"RunStarted","runId":"r1","goal":"summarize"}]}
{"target":"event","arguments":[{"type":"step_started","runId":"r1","stepId":"s1","tool":"pdf"}]}
not json
{"target":"tool:end","arguments":[{"step":"s1","tool":"pdf"}]}
{"target":"file:created","arguments":[{"fileName":"summary.txt","sizeBytes":512}]}
{"target":"event","arguments":[{"$type":"StepSucceeded","runId":"r1","stepId":"s1"}]}
{"target":"event","arguments":[{"$type":"RunSucceeded","runId":"r1"}]}
{"target":"event","arguments":[{"$type":"StepSucceeded","runId":"r1","stepId":"s1"}]}
"#;

    #[test]
    fn test_replay_renders_runs() {
        let out = replay(ClientSettings::default(), LOG, Some("r1"), None).unwrap();
        assert!(out.starts_with("5 event(s) applied, 1 ignored, 2 narration(s), 0 unhandled frame(s), 1 bad line(s)"));
        assert!(out.contains("run r1: Succeeded"));
        assert!(out.contains("  step s1 [pdf] Succeeded"));
        assert!(out.contains("  artifact summary.txt (512 bytes)"));
    }

    #[test]
    fn test_replay_into_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hub.log");
        fs::write(&path, LOG).unwrap();

        let out =
            replay_file(ClientSettings::default(), &path, Some("r1"), Some("local")).unwrap();
        assert!(out.contains("session local (2 message(s))"));
        assert!(out.contains("[Assistant] pdf completed"));
        assert!(out.contains("[Assistant] Created: summary.txt (0.5 KB)"));
    }
}
