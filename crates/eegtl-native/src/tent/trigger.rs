//! Cold/Adapting state machine
//!
//! ```text
//!        (i + 1) >= test_batch, stride == 1
//!  Cold ───────────────────────────────────► Adapting
//!   │                                          │
//!   └─ (i + 1) < test_batch: Cold              └─ every later i: Adapt
//! ```
//!
//! There is no transition back to Cold.

use super::error::{TentError, TentResult};

/// Trigger state
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerState {
    /// Fewer than `test_batch` trials seen
    Cold,
    /// Adaptation active
    Adapting,
}

/// What the driver must do for the current trial
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Predict with the unmodified model
    Cold,
    /// First full window: activate adaptation, then adapt
    Activate,
    /// Adapt on the current window
    Adapt,
}

/// Decides per sample index between the cold and adapting paths
#[derive(Clone, Debug)]
pub struct AdaptationTrigger {
    test_batch: usize,
    stride: usize,
    state: TriggerState,
}

impl AdaptationTrigger {
    /// Start in [`TriggerState::Cold`]
    #[must_use]
    pub fn new(test_batch: usize, stride: usize) -> Self {
        Self { test_batch, stride, state: TriggerState::Cold }
    }

    /// Current state
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Window width
    pub fn test_batch(&self) -> usize {
        self.test_batch
    }

    /// Decision for sample index `index` (0-based).
    ///
    /// Fails with [`TentError::UnsupportedStride`] once a window is full and
    /// the stride is not 1.
    pub fn observe(&mut self, index: usize) -> TentResult<Decision> {
        if index + 1 < self.test_batch {
            return Ok(match self.state {
                TriggerState::Cold => Decision::Cold,
                TriggerState::Adapting => Decision::Adapt,
            });
        }
        if self.stride != 1 {
            return Err(TentError::UnsupportedStride { stride: self.stride, index });
        }
        Ok(match self.state {
            TriggerState::Cold => {
                self.state = TriggerState::Adapting;
                Decision::Activate
            }
            TriggerState::Adapting => Decision::Adapt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_at_first_full_window() {
        let mut trigger = AdaptationTrigger::new(3, 1);
        let decisions: Vec<_> = (0..5).map(|i| trigger.observe(i).unwrap()).collect();
        assert_eq!(
            decisions,
            vec![Decision::Cold, Decision::Cold, Decision::Activate, Decision::Adapt, Decision::Adapt]
        );
        assert_eq!(trigger.state(), TriggerState::Adapting);
    }

    #[test]
    fn test_stride_checked_only_when_eligible() {
        let mut trigger = AdaptationTrigger::new(3, 2);
        assert_eq!(trigger.observe(0).unwrap(), Decision::Cold);
        assert_eq!(trigger.observe(1).unwrap(), Decision::Cold);
        assert!(matches!(trigger.observe(2), Err(TentError::UnsupportedStride { stride: 2, index: 2 })));
        assert_eq!(trigger.state(), TriggerState::Cold);
    }
}
