//! Push events: canonical types and the normalizer that produces them.

mod canonical;
mod normalize;

pub use canonical::{AgentEvent, Elapsed, HubFrame, Narration, Normalized};
pub use normalize::{normalize_event, normalize_frame, normalize_narration};
