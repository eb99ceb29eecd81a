//! Linear algebra and probability helpers
//!
//! This module provides:
//! - Spatial covariance of a trial (sample or population estimator)
//! - Inverse matrix square root with an identity fallback
//! - Numerically stable softmax, log-softmax and Shannon entropy

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::config::CovarianceEstimator;

/// Eigenvalues at or below this fraction of the largest one make a matrix
/// degenerate for the inverse square root.
pub const RELATIVE_EIGEN_FLOOR: f64 = 1e-12;

/// Absolute lower bound on the largest eigenvalue of a usable reference.
pub const ABSOLUTE_EIGEN_FLOOR: f64 = 1e-300;

// ============================================================================
// Covariance
// ============================================================================

/// Spatial covariance of a `channels × samples` matrix.
///
/// Channels are centred over time. With fewer than two samples the sample
/// estimator falls back to the population one.
#[must_use]
pub fn covariance(x: &DMatrix<f64>, estimator: CovarianceEstimator) -> DMatrix<f64> {
    let (channels, samples) = x.shape();
    if samples == 0 {
        return DMatrix::zeros(channels, channels);
    }

    let mut centred = x.clone();
    for mut row in centred.row_iter_mut() {
        let mean = row.mean();
        row.add_scalar_mut(-mean);
    }

    let denom = match estimator {
        CovarianceEstimator::Sample if samples > 1 => (samples - 1) as f64,
        _ => samples as f64,
    };

    let cov = &centred * centred.transpose() / denom;
    symmetrize(&cov)
}

/// `(m + mᵀ) / 2`
#[must_use]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

// ============================================================================
// Matrix Fractional Power
// ============================================================================

/// Result of an inverse square root.
#[derive(Clone, Debug, PartialEq)]
pub struct Whitening {
    /// `R^{-1/2}`, or the identity when `R` was degenerate
    pub matrix: DMatrix<f64>,
    /// True when the identity fallback was used
    pub degenerate: bool,
}

impl Whitening {
    /// Identity transform of the given size
    #[must_use]
    pub fn identity(n: usize) -> Self {
        Self { matrix: DMatrix::identity(n, n), degenerate: true }
    }

    /// Apply to a `channels × samples` trial
    #[must_use]
    pub fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        &self.matrix * x
    }
}

/// Inverse square root `R^{-1/2}` of a symmetric matrix.
///
/// Uses the symmetric eigendecomposition `R = V Λ Vᵀ`, so the result is
/// `V Λ^{-1/2} Vᵀ`. Non-square, non-finite, zero, singular or indefinite input
/// returns the identity with `degenerate` set; the result is always finite.
#[must_use]
pub fn inverse_sqrt(r: &DMatrix<f64>) -> Whitening {
    let n = r.nrows();
    if n == 0 || !r.is_square() || r.iter().any(|v| !v.is_finite()) {
        return Whitening::identity(n);
    }

    let eigen = SymmetricEigen::new(symmetrize(r));
    let max_eig = eigen.eigenvalues.max();
    if max_eig.is_nan() || max_eig <= ABSOLUTE_EIGEN_FLOOR {
        return Whitening::identity(n);
    }
    let floor = max_eig * RELATIVE_EIGEN_FLOOR;
    if eigen.eigenvalues.iter().any(|&l| l <= floor) {
        return Whitening::identity(n);
    }

    let inv_sqrt: DVector<f64> = eigen.eigenvalues.map(|l| 1.0 / l.sqrt());
    let v = &eigen.eigenvectors;
    let matrix = v * DMatrix::from_diagonal(&inv_sqrt) * v.transpose();

    if matrix.iter().any(|x| !x.is_finite()) {
        return Whitening::identity(n);
    }
    Whitening { matrix: symmetrize(&matrix), degenerate: false }
}

// ============================================================================
// Probabilities
// ============================================================================

/// Log-softmax of one row of logits
#[must_use]
pub fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = logits.iter().map(|&z| (z - max).exp()).sum::<f64>().ln() + max;
    logits.iter().map(|&z| z - log_sum).collect()
}

/// Softmax of one row of logits
#[must_use]
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    log_softmax(logits).into_iter().map(f64::exp).collect()
}

/// Row-wise softmax of an `n × classes` logit matrix
#[must_use]
pub fn softmax_rows(logits: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = logits.clone();
    for mut row in out.row_iter_mut() {
        let values: Vec<f64> = row.iter().copied().collect();
        for (dst, p) in row.iter_mut().zip(softmax(&values)) {
            *dst = p;
        }
    }
    out
}

/// Index of the largest value; first index on ties
#[must_use]
pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}
