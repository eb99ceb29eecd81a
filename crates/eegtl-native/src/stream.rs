//! Append-only trial buffer
//!
//! Keeps every raw trial in arrival order so sliding windows can be rebuilt
//! and re-aligned with the transform valid at any later index.

use eegtl_core::types::Trial;

/// Arrival-ordered store of raw trials
#[derive(Clone, Debug, Default)]
pub struct TrialBuffer {
    trials: Vec<Trial>,
}

impl TrialBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trial; returns its index
    pub fn push(&mut self, trial: Trial) -> usize {
        self.trials.push(trial);
        self.trials.len() - 1
    }

    /// Number of trials held
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// True before the first push
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Trial at `index`
    pub fn get(&self, index: usize) -> Option<&Trial> {
        self.trials.get(index)
    }

    /// Exactly `width` trials ending at `end` inclusive.
    ///
    /// `None` when `end` is out of range, `width` is zero or fewer than
    /// `width` trials precede it.
    pub fn window(&self, end: usize, width: usize) -> Option<&[Trial]> {
        if width == 0 || end >= self.trials.len() || end + 1 < width {
            return None;
        }
        Some(&self.trials[end + 1 - width..=end])
    }
}
