//! The single writer for session and run state.
//!
//! `SessionReducer` turns three inputs into the session/run model:
//! canonical [`AgentEvent`](crate::event::AgentEvent)s, narration, and
//! streamed content deltas. Every update is an idempotent upsert, runs and
//! steps only move forward, and a failed operation leaves state exactly as
//! it was before the operation began.
//!
//! # Module Structure
//!
//! - `turn`: streaming chat turns (`begin_turn` / `apply_delta` / `finish_turn`)
//! - `run`: agent runs (`begin_run`, `apply_event`, `apply_narration`)

mod run;
mod turn;

#[cfg(test)]
mod tests;

pub use turn::{StreamTicket, TurnInput};

use crate::config::ClientSettings;
use crate::error::{ClientError, Result};
use crate::run::Run;
use crate::session::{HistoryEntry, Message, RoleSource, Session};
use crate::stream::DeltaAccumulator;
use std::collections::HashMap;

/// Result of applying one event or narration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Changed,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// Why an input produced no state change. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The run already succeeded or failed
    TerminalRun,
    /// The step already succeeded or failed
    TerminalStep,
    /// Already applied
    Duplicate,
    /// Required field missing or empty
    Malformed,
    /// Shape the normalizer could not read
    Unknown,
}

/// The in-flight operation holding a session's guard.
#[derive(Debug)]
enum InFlight {
    Turn {
        message_id: String,
        accumulator: DeltaAccumulator,
        rollback: Vec<Message>,
    },
    RunStart {
        goal: String,
        run_id: Option<String>,
        rollback: Vec<Message>,
    },
}

/// Owner of all session and run state.
///
/// The reducer is synchronous. Callers sharing it across tasks wrap it in a
/// `tokio::sync::Mutex` and release the lock before awaiting.
#[derive(Debug)]
pub struct SessionReducer {
    settings: ClientSettings,
    sessions: HashMap<String, Session>,
    runs: HashMap<String, Run>,
    /// Run ids in first-seen order
    run_order: Vec<String>,
    in_flight: HashMap<String, InFlight>,
}

impl SessionReducer {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            sessions: HashMap::new(),
            runs: HashMap::new(),
            run_order: Vec::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    // ============================================================================
    // Sessions
    // ============================================================================

    /// Registers a session. An existing session with the same id is kept.
    pub fn create_session(&mut self, session_id: &str, title: &str) -> &Session {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!("[Reducer] Session created: {}", session_id);
                Session::new(session_id, title)
            })
    }

    /// Replaces a session's messages with persisted history.
    ///
    /// Entries that repeat an id update the earlier message in place.
    /// Rejected while the session has an operation in flight.
    pub fn load_history(
        &mut self,
        session_id: &str,
        title: &str,
        entries: Vec<HistoryEntry>,
    ) -> Result<&Session> {
        if self.in_flight.contains_key(session_id) {
            return Err(ClientError::busy(session_id));
        }

        let mut loaded = Session::new(session_id, title);
        let mut inferred = 0usize;
        for (index, entry) in entries.into_iter().enumerate() {
            let message = entry.into_message(index);
            if message.role_source == RoleSource::Inferred {
                inferred += 1;
            }
            loaded.upsert_message(message);
        }
        if inferred > 0 {
            tracing::debug!(
                "[Reducer] {} history message(s) in {} have an inferred role",
                inferred,
                session_id
            );
        }

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, title));
        session.title = title.to_string();
        session.messages = loaded.messages;
        session.touch();
        Ok(session)
    }

    pub fn rename_session(&mut self, session_id: &str, title: &str) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ClientError::not_found("session", session_id))?;
        session.title = title.to_string();
        session.touch();
        Ok(())
    }

    /// Removes a session locally along with its runs and any in-flight
    /// operation. Other sessions are untouched.
    pub fn remove_session(&mut self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id)?;
        self.in_flight.remove(session_id);

        let runs = &mut self.runs;
        self.run_order.retain(|run_id| {
            let bound = runs
                .get(run_id)
                .is_some_and(|run| run.session_id.as_deref() == Some(session_id));
            if bound {
                runs.remove(run_id);
            }
            !bound
        });

        tracing::info!("[Reducer] Session removed: {}", session_id);
        Some(removed)
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Sessions ordered by `updated_at`, latest first.
    pub fn sessions_by_recency(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Ids of every known session; used to rebuild hub subscriptions.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions_by_recency()
            .into_iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Whether a send or run start is in flight for the session.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.in_flight.contains_key(session_id)
    }

    fn guard(&self, session_id: &str) -> Result<()> {
        if self.in_flight.contains_key(session_id) {
            tracing::warn!(
                "[Reducer] Rejected operation on {}: another is in flight",
                session_id
            );
            return Err(ClientError::busy(session_id));
        }
        Ok(())
    }

    fn session_entry(&mut self, session_id: &str) -> &mut Session {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, "New Chat"))
    }
}
