//! Euclidean alignment
//!
//! Re-centres trials so the mean spatial covariance of a subject becomes the
//! identity:
//!
//! - [`OnlineAligner`]: running reference updated one trial at a time
//! - [`euclidean_align`]: whole-subject alignment with the mean covariance

use nalgebra::DMatrix;
use tracing::warn;

use eegtl_core::config::CovarianceEstimator;
use eegtl_core::error::{CoreError, CoreResult};
use eegtl_core::math::{covariance, inverse_sqrt, Whitening};
use eegtl_core::types::Trial;

// ============================================================================
// Online Alignment
// ============================================================================

/// Running reference covariance and its whitening transform.
///
/// After `i + 1` updates the reference is the arithmetic mean of the first
/// `i + 1` trial covariances.
#[derive(Clone, Debug)]
pub struct OnlineAligner {
    estimator: CovarianceEstimator,
    reference: Option<DMatrix<f64>>,
    whitening: Option<Whitening>,
    count: usize,
}

impl OnlineAligner {
    /// Empty aligner
    #[must_use]
    pub fn new(estimator: CovarianceEstimator) -> Self {
        Self {
            estimator,
            reference: None,
            whitening: None,
            count: 0,
        }
    }

    /// Fold one trial into the reference and recompute the whitening.
    ///
    /// Returns the updated reference. A degenerate reference falls back to the
    /// identity transform with a warning.
    pub fn update(&mut self, x: &DMatrix<f64>) -> CoreResult<&DMatrix<f64>> {
        let cov = covariance(x, self.estimator);
        let i = self.count as f64;

        let reference = match &self.reference {
            None => cov,
            Some(previous) => {
                if previous.shape() != cov.shape() {
                    return Err(CoreError::ShapeMismatch {
                        expected: previous.shape(),
                        actual: cov.shape(),
                    });
                }
                (previous * i + cov) / (i + 1.0)
            }
        };

        let whitening = inverse_sqrt(&reference);
        if whitening.degenerate {
            warn!(trial = self.count, "Degenerate reference covariance, using identity alignment");
        }
        self.whitening = Some(whitening);
        self.count += 1;
        Ok(self.reference.insert(reference))
    }

    /// Current reference, `None` before the first update
    pub fn reference(&self) -> Option<&DMatrix<f64>> {
        self.reference.as_ref()
    }

    /// Current whitening, `None` before the first update
    pub fn whitening(&self) -> Option<&Whitening> {
        self.whitening.as_ref()
    }

    /// Align a trial with the current whitening (identity before any update)
    pub fn align(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        match &self.whitening {
            Some(w) => w.apply(x),
            None => x.clone(),
        }
    }
}

// ============================================================================
// Offline Alignment
// ============================================================================

/// Arithmetic mean of the trial covariances
pub fn mean_covariance(trials: &[Trial], estimator: CovarianceEstimator) -> CoreResult<DMatrix<f64>> {
    let first = trials.first().ok_or(CoreError::EmptyInput { operation: "mean covariance" })?;
    let c = first.channels();
    let mut sum = DMatrix::<f64>::zeros(c, c);
    for trial in trials {
        if trial.channels() != c {
            return Err(CoreError::ShapeMismatch {
                expected: (c, first.samples()),
                actual: (trial.channels(), trial.samples()),
            });
        }
        sum += covariance(&trial.data, estimator);
    }
    Ok(sum / trials.len() as f64)
}

/// Align every trial of one subject with its own mean covariance.
///
/// Labels are kept. A degenerate mean covariance leaves the data unchanged.
pub fn euclidean_align(trials: &[Trial], estimator: CovarianceEstimator) -> CoreResult<Vec<Trial>> {
    let reference = mean_covariance(trials, estimator)?;
    let whitening = inverse_sqrt(&reference);
    if whitening.degenerate {
        warn!(trials = trials.len(), "Degenerate subject covariance, data left unaligned");
    }
    Ok(trials.iter().map(|t| t.with_data(whitening.apply(&t.data))).collect())
}
