//! Classifier models
//!
//! The adaptation code only talks to models through the [`Classifier`] trait:
//! forward and backward passes, a named parameter store, a declarative list of
//! adaptable parameters and a normalization-statistics switch. Nothing outside
//! a model inspects its layers.
//!
//! # Modules
//!
//! - [`params`]: Named parameter storage and state snapshots
//! - [`logvar`]: Reference backbone (spatial filter, log-variance, batch norm, linear head)
//! - [`optim`]: Adam over an explicit parameter subset
//! - [`loss`]: Cross-entropy and multi-kernel MMD objectives
//! - [`checkpoint`]: Snapshot files keyed by dataset, backbone, subject and seed

use std::path::PathBuf;

use nalgebra::DMatrix;
use thiserror::Error;

use eegtl_core::config::Backbone;

pub mod checkpoint;
pub mod logvar;
pub mod loss;
pub mod optim;
pub mod params;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointKey};
pub use logvar::LogVarNet;
pub use loss::{cross_entropy, Discrepancy, MkMmd};
pub use optim::Adam;
pub use params::{Gradients, ParameterStore, StateDict, TensorData};

// ============================================================================
// Error Types
// ============================================================================

/// Errors from models, optimizers and checkpoints
#[derive(Error, Debug)]
pub enum ModelError {
    /// Forward pass on no trials
    #[error("Empty batch")]
    EmptyBatch,

    /// Batch statistics requested on a single trial
    #[error("Batch statistics need at least 2 trials, got {got}")]
    BatchTooSmall {
        /// Batch size received
        got: usize,
    },

    /// Input trial with the wrong channel count
    #[error("Trial {index} has {got} channels, model expects {expected}")]
    ChannelMismatch {
        /// Position in the batch
        index: usize,
        /// Channels received
        got: usize,
        /// Channels expected
        expected: usize,
    },

    /// Output gradient does not match the last forward pass
    #[error("Gradient shape {got:?} does not match output shape {expected:?}")]
    GradientShape {
        /// Shape of the last output
        expected: (usize, usize),
        /// Shape received
        got: (usize, usize),
    },

    /// Source and target feature batches differ in shape
    #[error("Domain batches differ: source {source_shape:?}, target {target:?}")]
    DomainShape {
        /// Source feature shape
        source_shape: (usize, usize),
        /// Target feature shape
        target: (usize, usize),
    },

    /// Parameter name not registered
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Buffer used where a learnable parameter is required
    #[error("Tensor {0} is a buffer and cannot be learned")]
    NotLearnable(String),

    /// Snapshot lacks a registered tensor
    #[error("Missing tensor in snapshot: {0}")]
    MissingTensor(String),

    /// Snapshot tensor has the wrong shape
    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    TensorShape {
        /// Tensor name
        name: String,
        /// Registered shape
        expected: (usize, usize),
        /// Snapshot shape
        actual: (usize, usize),
    },

    /// `backward` without a preceding `forward`
    #[error("Backward pass requested before any forward pass")]
    NoForwardCache,

    /// Not enough data for a fit
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Linear system could not be solved
    #[error("Singular matrix during {operation}")]
    Singular {
        /// Operation that failed
        operation: &'static str,
    },

    /// Checkpoint file missing
    #[error("Checkpoint not found: {}", path.display())]
    CheckpointNotFound {
        /// Expected location
        path: PathBuf,
    },

    /// Checkpoint written by another backbone
    #[error("Checkpoint backbone mismatch: expected {expected}, found {found}")]
    BackboneMismatch {
        /// Backbone of the model
        expected: String,
        /// Backbone in the file
        found: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

// ============================================================================
// Classifier Interface
// ============================================================================

/// Which statistics normalization layers use
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NormMode {
    /// Stored running statistics (inference)
    Running,
    /// Batch statistics, running statistics updated with momentum
    BatchTracked,
    /// Batch statistics, running statistics left untouched (test-time adaptation)
    Batch,
}

impl NormMode {
    /// Whether the forward pass normalizes with batch statistics
    #[must_use]
    pub const fn uses_batch_stats(self) -> bool {
        matches!(self, Self::BatchTracked | Self::Batch)
    }
}

/// Output of a forward pass over `n` trials
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// `n × feature_dim` feature-extractor output
    pub features: DMatrix<f64>,
    /// `n × class_num` logits
    pub logits: DMatrix<f64>,
}

/// A trial classifier the adaptation loop can drive.
///
/// `backward` differentiates the most recent `forward` call and returns
/// gradients only for parameters that currently require them.
pub trait Classifier {
    /// Backbone identifier, used in checkpoint names
    fn backbone(&self) -> Backbone;

    /// Number of output classes
    fn class_num(&self) -> usize;

    /// Run the model on a batch of `channels × samples` trials
    fn forward(&mut self, batch: &[DMatrix<f64>]) -> ModelResult<ForwardOutput>;

    /// Back-propagate output gradients of the last forward pass.
    ///
    /// `grad_logits` must match the last logits; `grad_features`, when given,
    /// must match the last features.
    fn backward(
        &mut self,
        grad_logits: &DMatrix<f64>,
        grad_features: Option<&DMatrix<f64>>,
    ) -> ModelResult<Gradients>;

    /// Parameter store
    fn parameters(&self) -> &ParameterStore;

    /// Mutable parameter store
    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Parameters test-time adaptation may update, by name
    fn adaptable_parameters(&self) -> Vec<String>;

    /// Current normalization mode
    fn norm_mode(&self) -> NormMode;

    /// Switch normalization mode
    fn set_norm_mode(&mut self, mode: NormMode);
}

/// Build a freshly initialised model for the given backbone
pub fn build_classifier(
    backbone: Backbone,
    channels: usize,
    class_num: usize,
    seed: u64,
) -> Box<dyn Classifier> {
    match backbone {
        Backbone::LogVarNet => Box::new(LogVarNet::new(channels, class_num, seed)),
    }
}
