//! Per-message text accumulation with duplicate-fragment suppression.

use serde::{Deserialize, Serialize};

/// How repeated fragments are detected.
///
/// `Suffix` drops a fragment that equals the previous fragment or that the
/// accumulated text already ends with. It hides upstream retry duplicates
/// but can also drop a token the model genuinely repeats (e.g. "l" after
/// "Hel"). Use `Adjacent` or `Off` for backends that do not duplicate.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FragmentDedup {
    Off,
    Adjacent,
    #[default]
    Suffix,
}

/// Accumulated text for one in-flight message.
#[derive(Debug, Clone, Default)]
pub struct DeltaAccumulator {
    text: String,
    last_fragment: Option<String>,
    mode: FragmentDedup,
}

impl DeltaAccumulator {
    pub fn new(mode: FragmentDedup) -> Self {
        Self {
            text: String::new(),
            last_fragment: None,
            mode,
        }
    }

    /// Appends `fragment` unless it is empty or a duplicate under the
    /// configured mode. Returns whether the text changed.
    pub fn push(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() || self.is_duplicate(fragment) {
            return false;
        }
        self.text.push_str(fragment);
        self.last_fragment = Some(fragment.to_string());
        true
    }

    fn is_duplicate(&self, fragment: &str) -> bool {
        let repeats_last = self.last_fragment.as_deref() == Some(fragment);
        match self.mode {
            FragmentDedup::Off => false,
            FragmentDedup::Adjacent => repeats_last,
            FragmentDedup::Suffix => repeats_last || self.text.ends_with(fragment),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Final text with a single trailing newline removed.
    pub fn finish(&self) -> String {
        self.text
            .strip_suffix('\n')
            .unwrap_or(&self.text)
            .to_string()
    }
}
