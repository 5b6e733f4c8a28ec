//! Line assembly and SSE line classification.

use super::delta::{StreamDelta, decode_payload};

const DATA_MARKER: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Splits a chunked text stream into complete lines.
///
/// A line split across chunks is held in the buffer until its newline
/// arrives. Byte input may also split a UTF-8 sequence; the incomplete
/// tail is kept back until the next chunk completes it.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: String,
    pending_bytes: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        self.drain_lines()
    }

    /// Byte-level variant of [`feed`](Self::feed).
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(chunk);
        let text = drain_utf8(&mut self.pending_bytes);
        self.buffer.push_str(&text);
        self.drain_lines()
    }

    /// Returns the unterminated remainder at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.buffer.push_str(&tail);
            self.pending_bytes.clear();
        }

        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.strip_suffix('\r').unwrap_or(&rest);
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete[..last_newline]
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }
}

/// Decodes as much of `pending` as forms valid UTF-8, leaving an incomplete
/// trailing sequence in place. Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        let (valid, invalid_len) = match std::str::from_utf8(&pending[..]) {
            Ok(_) => (pending.len(), None),
            Err(err) => (err.valid_up_to(), err.error_len()),
        };
        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match invalid_len {
            Some(len) => {
                out.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + len);
            }
            None => {
                pending.drain(..valid);
                return out;
            }
        }
    }
}

/// A complete stream line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Separator, comment, SSE field line or whitespace-only payload
    Blank,
    /// Payload after the `data:` marker, leading whitespace kept
    Data(String),
    /// End-of-stream sentinel
    Done,
    /// Non-SSE plain text line
    Text(String),
}

impl SseLine {
    pub fn classify(line: &str) -> Self {
        if line.trim().is_empty() {
            return Self::Blank;
        }

        if let Some(rest) = line.strip_prefix(DATA_MARKER) {
            // Only the marker and its single separating space are stripped.
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            let trimmed = payload.trim();
            if trimmed == DONE_SENTINEL {
                return Self::Done;
            }
            if trimmed.is_empty() {
                return Self::Blank;
            }
            return Self::Data(payload.to_string());
        }

        if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            return Self::Blank;
        }

        Self::Text(line.to_string())
    }

    /// Converts the line into a content delta. Blank and Done carry none.
    pub fn into_delta(self) -> Option<StreamDelta> {
        match self {
            Self::Data(payload) => Some(decode_payload(&payload)),
            Self::Text(line) => Some(StreamDelta::Text(format!("{line}\n"))),
            Self::Blank | Self::Done => None,
        }
    }
}

/// Assembler plus classification: bytes in, content deltas out.
///
/// Reaching the `[DONE]` sentinel marks the decoder done; later lines are
/// discarded. Closing the underlying response is left to the caller.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineAssembler,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<StreamDelta> {
        let lines = self.lines.feed_bytes(chunk);
        self.collect(lines)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<StreamDelta> {
        let lines = self.lines.feed(chunk);
        self.collect(lines)
    }

    /// Flushes the final unterminated line.
    pub fn finish(&mut self) -> Vec<StreamDelta> {
        let tail = self.lines.finish().into_iter().collect();
        self.collect(tail)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn collect(&mut self, lines: Vec<String>) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        for line in lines {
            if self.done {
                break;
            }
            match SseLine::classify(&line) {
                SseLine::Done => {
                    tracing::debug!("[Stream] end-of-stream sentinel received");
                    self.done = true;
                }
                other => deltas.extend(other.into_delta()),
            }
        }
        deltas
    }
}
