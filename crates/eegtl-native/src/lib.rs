//! EEG Transfer Native - streaming alignment and test-time adaptation
//!
//! This crate provides the host-side pipeline for cross-subject motor-imagery
//! decoding:
//! - Online and offline Euclidean alignment
//! - An append-only trial buffer for sliding windows
//! - Tent: entropy minimization on normalization affine parameters
//! - Dataset loading, source calibration and experiment reporting
//! - DAN: source training with an MK-MMD feature alignment term
//!
//! # Modules
//!
//! - [`alignment`]: Running reference covariance and whitening
//! - [`stream`]: Arrival-ordered trial storage
//! - [`model`]: Classifier interface, reference backbone, optimizer, checkpoints
//! - [`tent`]: Trigger, adapter and online driver
//! - [`data`]: Dataset files, subjects and folds
//! - [`dan`]: Deep adaptation network training
//! - [`experiment`]: Seeds × subjects runner
//! - [`report`]: Result CSV files

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod alignment;
pub mod dan;
pub mod data;
pub mod experiment;
pub mod model;
pub mod report;
pub mod stream;
pub mod tent;

// Re-export key types
pub use alignment::{euclidean_align, OnlineAligner};
pub use data::{CyclicBatches, DatasetLoader, Fold, SubjectTrials};
pub use dan::{train_dan, DanTrainer};
pub use experiment::{DanReport, ExperimentError, ExperimentReport, ExperimentRunner};
pub use model::{Classifier, LogVarNet, ModelError};
pub use stream::TrialBuffer;
pub use tent::{SessionOutcome, TentError, TentSession};
