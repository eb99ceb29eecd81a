//! EEG Transfer Core - shared types and numerics
//!
//! This crate provides the foundational types, configuration, linear algebra
//! and metrics used by the streaming adaptation crates.
//!
//! # Modules
//!
//! - [`types`]: Datasets, subjects and trials
//! - [`config`]: Immutable run-level configuration
//! - [`error`]: Error types for configuration, shapes and metrics
//! - [`math`]: Covariance, inverse square root, softmax and entropy
//! - [`metrics`]: Accuracy and ROC AUC
//!
//! # Example
//!
//! ```rust
//! use eegtl_core::config::CovarianceEstimator;
//! use eegtl_core::math::{covariance, inverse_sqrt};
//! use nalgebra::DMatrix;
//!
//! let trial = DMatrix::from_fn(3, 64, |c, t| ((t * (c + 1)) as f64 * 0.3).sin());
//! let r = covariance(&trial, CovarianceEstimator::Sample);
//! let w = inverse_sqrt(&r);
//! assert!(!w.degenerate);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod error;
pub mod math;
pub mod metrics;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{
    Backbone, CalibrationConfig, CovarianceEstimator, DanConfig, EvaluationPolicy, ExperimentConfig, TentConfig,
};
pub use error::{CoreError, CoreResult};
pub use math::{covariance, inverse_sqrt, Whitening};
pub use types::{DatasetId, DatasetSpec, Paradigm, SubjectId, Trial};
