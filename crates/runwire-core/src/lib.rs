//! Core domain of the runwire client: session and run state, the canonical
//! event model and the streaming decoders that feed it.

pub mod config;
pub mod error;
pub mod event;
pub mod permission;
pub mod reducer;
pub mod run;
pub mod session;
pub mod stream;

// Re-export common types
pub use config::ClientSettings;
pub use error::{ClientError, Result};
pub use reducer::{ApplyOutcome, IgnoreReason, SessionReducer};
