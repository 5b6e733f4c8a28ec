//! Streaming chat response handling.
//!
//! # Module Structure
//!
//! - `assembler`: chunk → line reassembly and SSE line classification
//! - `delta`: payload decoding into `StreamDelta`
//! - `accumulator`: per-message text accumulation with fragment dedup

mod accumulator;
mod assembler;
mod delta;

pub use accumulator::{DeltaAccumulator, FragmentDedup};
pub use assembler::{LineAssembler, SseDecoder, SseLine};
pub use delta::{StreamDelta, decode_payload};
