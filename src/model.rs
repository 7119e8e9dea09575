//! Executable model of the composed-text edit state the fix operates on.
//!
//! Mirrors the emitted JavaScript step for step: count the delete-markers,
//! strip them, apply that many delete-reductions to the baseline, then one
//! insert-reduction per remaining character, and decide what gets published.
//! [`apply_defect`] mirrors the shipped behavior. Both serve as the expected
//! results when fragments are executed under node in the integration tests.

use crate::config::DELETE_MARKER;

/// Immutable text-plus-cursor value advanced by reductions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditState {
    chars: Vec<char>,
    offset: usize,
}

impl EditState {
    /// A state with the cursor at the end of `text`.
    pub fn new(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let offset = chars.len();
        Self { chars, offset }
    }

    pub fn with_offset(text: &str, offset: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let offset = offset.min(chars.len());
        Self { chars, offset }
    }

    pub fn text(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Delete the character before the cursor.
    #[must_use]
    pub fn backspace(&self) -> Self {
        if self.offset == 0 {
            return self.clone();
        }
        let mut chars = self.chars.clone();
        chars.remove(self.offset - 1);
        Self {
            chars,
            offset: self.offset - 1,
        }
    }

    /// Insert one character at the cursor.
    #[must_use]
    pub fn insert(&self, c: char) -> Self {
        let mut chars = self.chars.clone();
        chars.insert(self.offset, c);
        Self {
            chars,
            offset: self.offset + 1,
        }
    }
}

/// What the corrective code hands to the publish callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publication {
    pub text: Option<String>,
    pub offset: Option<usize>,
}

impl Publication {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.offset.is_none()
    }
}

/// Final state and publication after the corrected logic runs.
pub fn apply_fix(baseline: &EditState, input: &str) -> (EditState, Publication) {
    let count = input.chars().filter(|c| *c == DELETE_MARKER).count();
    let replacement: String = input.chars().filter(|c| *c != DELETE_MARKER).collect();

    let mut state = baseline.clone();
    for _ in 0..count {
        state = state.backspace();
    }
    for c in replacement.chars() {
        state = state.insert(c);
    }

    let publication = publish(baseline, &state);
    (state, publication)
}

/// Final state and publication under the shipped, deletion-only logic.
pub fn apply_defect(baseline: &EditState, input: &str) -> (EditState, Publication) {
    let count = input.chars().filter(|c| *c == DELETE_MARKER).count();
    let mut state = baseline.clone();
    for _ in 0..count {
        state = state.backspace();
    }
    let publication = publish(baseline, &state);
    (state, publication)
}

fn publish(baseline: &EditState, state: &EditState) -> Publication {
    if baseline == state {
        return Publication::default();
    }
    Publication {
        text: (baseline.chars != state.chars).then(|| state.text()),
        offset: Some(state.offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers(n: usize) -> String {
        std::iter::repeat(DELETE_MARKER).take(n).collect()
    }

    #[test]
    fn test_three_markers_two_characters() {
        let baseline = EditState::new("xin chaof");
        let input = format!("{}ào", markers(3));

        let (fixed, publication) = apply_fix(&baseline, &input);
        assert_eq!(fixed.text(), "xin chào");
        assert_eq!(fixed.offset(), 8);
        assert_eq!(publication.text.as_deref(), Some("xin chào"));
        assert_eq!(publication.offset, Some(8));

        let (broken, _) = apply_defect(&baseline, &input);
        assert_eq!(broken.text(), "xin ch");
        assert_ne!(broken, fixed);
    }

    #[test]
    fn test_markers_only_matches_defect() {
        let baseline = EditState::new("abc");
        let input = markers(2);
        assert_eq!(apply_fix(&baseline, &input), apply_defect(&baseline, &input));
    }

    #[test]
    fn test_unchanged_state_publishes_nothing() {
        let baseline = EditState::new("ab");
        let input = format!("{}b", markers(1));
        let (state, publication) = apply_fix(&baseline, &input);
        assert_eq!(state, baseline);
        assert!(publication.is_empty());
    }

    #[test]
    fn test_backspace_clamps_at_start() {
        let baseline = EditState::with_offset("a", 0);
        let (state, publication) = apply_fix(&baseline, &markers(1));
        assert_eq!(state, baseline);
        assert!(publication.is_empty());

        let baseline = EditState::with_offset("ab", 1);
        let (state, publication) = apply_fix(&baseline, &format!("{}a", markers(1)));
        assert_eq!(state.text(), "ab");
        assert_eq!(state.offset(), 1);
        assert!(publication.is_empty());
    }

    #[test]
    fn test_cursor_in_middle() {
        let baseline = EditState::with_offset("tieng viet", 5);
        let (state, publication) = apply_fix(&baseline, &format!("{}ếng", markers(3)));
        assert_eq!(state.text(), "tiếng viet");
        assert_eq!(publication.offset, Some(5));
    }
}
