//! Streaming test-time adaptation (Tent)
//!
//! A target subject's trials arrive one at a time. Until `test_batch` trials
//! have been seen the source model predicts unchanged; from then on every
//! trial triggers an entropy-minimization update of the normalization affine
//! parameters on the most recent `test_batch` aligned trials.
//!
//! # Modules
//!
//! - [`trigger`]: Cold/Adapting state machine
//! - [`adapter`]: Entropy objective and optimizer ownership
//! - [`session`]: Per-trial driver and scoring
//! - [`error`]: Session errors

pub mod adapter;
pub mod error;
pub mod session;
pub mod trigger;

pub use adapter::{mean_entropy, Adaptation, EntropyAdapter};
pub use error::{TentError, TentResult};
pub use session::{Prediction, PredictionPath, SessionOutcome, TentSession};
pub use trigger::{AdaptationTrigger, Decision, TriggerState};
