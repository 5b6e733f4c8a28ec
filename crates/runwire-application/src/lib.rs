//! Application layer for runwire.
//!
//! Use cases that drive the session reducer from the network side: streamed
//! chat turns and session CRUD (`ChatService`), agent runs over the push hub
//! (`AgentService`), and offline replay of recorded hub frames.

pub mod agent_service;
pub mod chat_service;
pub mod replay;

pub use agent_service::AgentService;
pub use chat_service::ChatService;
pub use replay::{FrameReport, apply_frame};

use runwire_core::SessionReducer;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The reducer as shared between services. Never held across an `.await`.
pub type SharedReducer = Arc<Mutex<SessionReducer>>;
