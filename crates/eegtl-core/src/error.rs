//! Error types for EEG transfer experiments
//!
//! Errors raised by configuration validation, shape checks and metric
//! computation. They carry enough context to be logged as-is.

use core::fmt;

// ============================================================================
// Core Errors
// ============================================================================

/// Errors from core types, configuration and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Dataset name not recognised
    UnknownDataset {
        /// The name that was given
        name: String,
    },
    /// Trial or matrix has the wrong shape
    ShapeMismatch {
        /// Expected (rows, cols)
        expected: (usize, usize),
        /// Actual (rows, cols)
        actual: (usize, usize),
    },
    /// Configuration value out of range
    InvalidConfig {
        /// Parameter name
        parameter: &'static str,
        /// What is wrong with it
        reason: String,
    },
    /// Imbalanced evaluation requested for a multi-class dataset
    ImbalancedMultiClass {
        /// Number of classes
        class_num: usize,
    },
    /// Metric requested on empty input
    EmptyInput {
        /// Which computation
        operation: &'static str,
    },
    /// Prediction and label sequences differ in length
    LengthMismatch {
        /// Number of labels
        labels: usize,
        /// Number of predictions
        predictions: usize,
    },
    /// AUC undefined because only one class is present
    SingleClass {
        /// The class present
        class: usize,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDataset { name } => {
                write!(f, "Unknown dataset '{name}' (expected BNCI2014001, BNCI2014002, BNCI2015001 or BNCI2014001-4)")
            }
            Self::ShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "Shape mismatch: expected {}×{}, got {}×{}",
                    expected.0, expected.1, actual.0, actual.1
                )
            }
            Self::InvalidConfig { parameter, reason } => {
                write!(f, "Invalid configuration for {parameter}: {reason}")
            }
            Self::ImbalancedMultiClass { class_num } => {
                write!(f, "Imbalanced evaluation is not implemented for {class_num}-class data")
            }
            Self::EmptyInput { operation } => write!(f, "{operation}: empty input"),
            Self::LengthMismatch { labels, predictions } => {
                write!(f, "Length mismatch: {labels} labels vs {predictions} predictions")
            }
            Self::SingleClass { class } => {
                write!(f, "AUC undefined: only class {class} present in labels")
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = CoreError::ImbalancedMultiClass { class_num: 4 };
        assert!(err.to_string().contains("4-class"));

        let err = CoreError::ShapeMismatch { expected: (22, 1001), actual: (13, 2561) };
        assert_eq!(err.to_string(), "Shape mismatch: expected 22×1001, got 13×2561");
    }
}
