//! Session domain module.
//!
//! # Module Structure
//!
//! - `model`: the `Session` entity
//! - `message`: chat message types (`Message`, `MessageRole`, `MessageStatus`)
//! - `history`: persisted history entries and role resolution

mod history;
mod message;
mod model;

pub use history::{ChatSummary, HistoryEntry, infer_role};
pub use message::{Message, MessageMetadata, MessageRole, MessageStatus, RoleSource, SearchResult};
pub use model::Session;
