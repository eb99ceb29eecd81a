//! Tent session errors

use thiserror::Error;

use eegtl_core::error::CoreError;

use crate::model::ModelError;

/// Errors that abort an online session
#[derive(Error, Debug)]
pub enum TentError {
    /// Invalid configuration or metric input
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    /// Model, optimizer or checkpoint failure
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Trial shape differs from the first trial of the stream
    #[error("Trial {index} is {actual:?}, stream started with {expected:?}")]
    TrialShape {
        /// Sample index
        index: usize,
        /// Shape of the first trial
        expected: (usize, usize),
        /// Shape received
        actual: (usize, usize),
    },

    /// Sliding-window stride other than 1
    #[error("Stride {stride} is unsupported at trial {index}, adaptation requires stride 1")]
    UnsupportedStride {
        /// Configured stride
        stride: usize,
        /// Sample index where adaptation became eligible
        index: usize,
    },

    /// Buffer could not supply a full window
    #[error("Window of {width} trials ending at {end} is unavailable")]
    WindowUnavailable {
        /// Last index of the window
        end: usize,
        /// Requested width
        width: usize,
    },

    /// Scoring needs a label the trial does not carry
    #[error("Trial {index} has no label")]
    UnlabeledTrial {
        /// Sample index
        index: usize,
    },
}

/// Result type for Tent sessions
pub type TentResult<T> = Result<T, TentError>;
