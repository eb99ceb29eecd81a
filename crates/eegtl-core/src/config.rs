//! Run-level configuration
//!
//! Every component receives one immutable configuration value at construction;
//! nothing reads global state. All structs are `serde` types so a whole
//! experiment can be described in a single JSON file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{DatasetId, DatasetSpec};

/// How the spatial covariance of a single trial is estimated.
///
/// Both estimators centre every channel first. `Sample` divides by `T - 1`
/// (the unbiased estimator), `Population` divides by `T`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceEstimator {
    /// Unbiased, divides by `T - 1`
    #[default]
    Sample,
    /// Biased, divides by `T`
    Population,
}

/// End-of-run scoring policy, chosen once per run
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPolicy {
    /// Balanced target: accuracy
    #[default]
    Balanced,
    /// 2:1 imbalanced binary target: ROC AUC of the class-1 probability
    Imbalanced,
}

impl EvaluationPolicy {
    /// Metric name used in log lines
    #[must_use]
    pub const fn metric_name(self) -> &'static str {
        match self {
            Self::Balanced => "Acc",
            Self::Imbalanced => "AUC",
        }
    }

    /// Reject policies that have no metric for this many classes
    pub fn check_classes(self, class_num: usize) -> CoreResult<()> {
        if self == Self::Imbalanced && class_num > 2 {
            return Err(CoreError::ImbalancedMultiClass { class_num });
        }
        Ok(())
    }
}

/// Classifier backbones the model factory can build
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backbone {
    /// Spatial filter, log-variance, batch norm, linear head
    #[default]
    LogVarNet,
}

impl Backbone {
    /// Name used in checkpoint file names
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LogVarNet => "LogVarNet",
        }
    }
}

/// Tent streaming test-time adaptation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TentConfig {
    /// Sliding window width; adaptation starts once this many trials arrived
    pub test_batch: usize,
    /// Gradient steps per window
    pub steps: usize,
    /// Window stride, must be 1 once adaptation is active
    pub stride: usize,
    /// Adam learning rate
    pub lr: f64,
    /// Apply incremental Euclidean alignment
    pub align: bool,
    /// Scoring policy
    pub policy: EvaluationPolicy,
    /// Log per-trial alignment latency
    pub calc_time: bool,
    /// Trial covariance estimator used by the alignment reference
    pub covariance: CovarianceEstimator,
}

impl Default for TentConfig {
    fn default() -> Self {
        Self {
            test_batch: 8,
            steps: 1,
            stride: 1,
            lr: 0.001,
            align: true,
            policy: EvaluationPolicy::Balanced,
            calc_time: false,
            covariance: CovarianceEstimator::Sample,
        }
    }
}

impl TentConfig {
    /// Validate ranges.
    ///
    /// The stride is deliberately not checked here: it only becomes fatal when
    /// the stream reaches the first full window.
    pub fn validate(&self) -> CoreResult<()> {
        if self.test_batch < 2 {
            return Err(CoreError::InvalidConfig {
                parameter: "test_batch",
                reason: format!("batch statistics need at least 2 trials, got {}", self.test_batch),
            });
        }
        if self.steps == 0 {
            return Err(CoreError::InvalidConfig {
                parameter: "steps",
                reason: "at least one adaptation step is required".to_string(),
            });
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(CoreError::InvalidConfig {
                parameter: "lr",
                reason: format!("learning rate must be positive and finite, got {}", self.lr),
            });
        }
        Ok(())
    }
}

/// Source calibration settings for the closed-form fit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Trials per normalization-statistics batch
    pub batch_size: usize,
    /// Batches streamed through the normalization layers
    pub iterations: usize,
    /// Covariance shrinkage of the discriminant head, in `[0, 1]`
    pub shrinkage: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self { batch_size: 32, iterations: 200, shrinkage: 0.1 }
    }
}

impl CalibrationConfig {
    /// Validate ranges
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size < 2 {
            return Err(CoreError::InvalidConfig {
                parameter: "batch_size",
                reason: format!("batch statistics need at least 2 trials, got {}", self.batch_size),
            });
        }
        if !(0.0..=1.0).contains(&self.shrinkage) {
            return Err(CoreError::InvalidConfig {
                parameter: "shrinkage",
                reason: format!("must lie in [0, 1], got {}", self.shrinkage),
            });
        }
        Ok(())
    }
}

/// Domain adaptation network training settings.
///
/// Each step pairs a labelled source batch with an unlabelled target batch of
/// the same size and minimizes cross-entropy plus `alignment_weight` times the
/// multi-kernel MMD between their features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DanConfig {
    /// Trials per source and per target batch
    pub batch_size: usize,
    /// Passes over the source set
    pub epochs: usize,
    /// Adam learning rate
    pub lr: f64,
    /// Weight of the MMD term
    pub alignment_weight: f64,
    /// Linear-time MMD estimator instead of the quadratic one
    pub linear: bool,
}

impl Default for DanConfig {
    fn default() -> Self {
        Self { batch_size: 32, epochs: 100, lr: 0.001, alignment_weight: 1.0, linear: true }
    }
}

impl DanConfig {
    /// Validate ranges
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size < 2 {
            return Err(CoreError::InvalidConfig {
                parameter: "dan.batch_size",
                reason: format!("MMD needs at least 2 trials per domain, got {}", self.batch_size),
            });
        }
        if self.epochs == 0 {
            return Err(CoreError::InvalidConfig {
                parameter: "dan.epochs",
                reason: "at least one epoch is required".to_string(),
            });
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(CoreError::InvalidConfig {
                parameter: "dan.lr",
                reason: format!("learning rate must be positive and finite, got {}", self.lr),
            });
        }
        if !(self.alignment_weight.is_finite() && self.alignment_weight >= 0.0) {
            return Err(CoreError::InvalidConfig {
                parameter: "dan.alignment_weight",
                reason: format!("must be finite and non-negative, got {}", self.alignment_weight),
            });
        }
        Ok(())
    }
}

/// Full experiment description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Dataset to run on
    pub dataset: DatasetId,
    /// Classifier backbone
    pub backbone: Backbone,
    /// Method name used for result files
    pub method: String,
    /// Seeds; one independent adaptation per seed and subject
    pub seeds: Vec<u64>,
    /// Directory holding `<dataset>/X.npy`, `labels.npy`, `meta.csv`
    pub data_path: PathBuf,
    /// Directory holding `<dataset>/<backbone>_S<id>_seed<seed>.ckpt`
    pub runs_path: PathBuf,
    /// Directory receiving result CSV files
    pub log_path: PathBuf,
    /// Report offline-EA accuracy on the target before streaming
    pub offline_eval: bool,
    /// Tent settings
    pub tent: TentConfig,
    /// Source calibration settings
    pub calibration: CalibrationConfig,
    /// Domain adaptation network settings
    pub dan: DanConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetId::Bnci2014001,
            backbone: Backbone::LogVarNet,
            method: "Tent".to_string(),
            seeds: (1..=11).collect(),
            data_path: PathBuf::from("./data"),
            runs_path: PathBuf::from("./runs"),
            log_path: PathBuf::from("./logs"),
            offline_eval: true,
            tent: TentConfig::default(),
            calibration: CalibrationConfig::default(),
            dan: DanConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Recording constants of the configured dataset
    #[must_use]
    pub fn spec(&self) -> DatasetSpec {
        self.dataset.spec()
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> CoreResult<()> {
        self.tent.validate()?;
        self.calibration.validate()?;
        self.dan.validate()?;
        self.tent.policy.check_classes(self.spec().class_num)?;
        if self.seeds.is_empty() {
            return Err(CoreError::InvalidConfig {
                parameter: "seeds",
                reason: "at least one seed is required".to_string(),
            });
        }
        if self.method.is_empty() {
            return Err(CoreError::InvalidConfig {
                parameter: "method",
                reason: "method name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ExperimentConfig::default().validate().is_ok());
        assert_eq!(ExperimentConfig::default().seeds.len(), 11);
    }

    #[test]
    fn test_stride_is_not_rejected_upfront() {
        let tent = TentConfig { stride: 2, ..TentConfig::default() };
        assert!(tent.validate().is_ok());
    }

    #[test]
    fn test_test_batch_lower_bound() {
        let tent = TentConfig { test_batch: 1, ..TentConfig::default() };
        assert!(matches!(
            tent.validate(),
            Err(CoreError::InvalidConfig { parameter: "test_batch", .. })
        ));
    }

    #[test]
    fn test_calibration_ranges() {
        let calibration = CalibrationConfig { shrinkage: 1.5, ..CalibrationConfig::default() };
        assert!(matches!(
            calibration.validate(),
            Err(CoreError::InvalidConfig { parameter: "shrinkage", .. })
        ));
    }

    #[test]
    fn test_dan_ranges() {
        assert!(DanConfig::default().validate().is_ok());
        let dan = DanConfig { batch_size: 1, ..DanConfig::default() };
        assert!(matches!(
            dan.validate(),
            Err(CoreError::InvalidConfig { parameter: "dan.batch_size", .. })
        ));
        let dan = DanConfig { alignment_weight: -1.0, ..DanConfig::default() };
        assert!(dan.validate().is_err());
    }

    #[test]
    fn test_imbalanced_four_class_rejected() {
        let config = ExperimentConfig {
            dataset: DatasetId::Bnci2014001FourClass,
            tent: TentConfig { policy: EvaluationPolicy::Imbalanced, ..TentConfig::default() },
            ..ExperimentConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(CoreError::ImbalancedMultiClass { class_num: 4 })
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"dataset":"BNCI2015001","tent":{"test_batch":16}}"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.dataset, DatasetId::Bnci2015001);
        assert_eq!(config.tent.test_batch, 16);
        assert_eq!(config.tent.steps, 1);
        assert!(config.tent.align);
    }
}
