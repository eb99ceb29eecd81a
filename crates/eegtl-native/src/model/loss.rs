//! Training objectives with gradients
//!
//! - [`cross_entropy`]: mean cross-entropy of labelled logits
//! - [`MkMmd`]: multi-kernel maximum mean discrepancy between two feature
//!   batches of equal size, with Gaussian kernels whose bandwidths follow the
//!   mean pairwise squared distance

use nalgebra::DMatrix;

use eegtl_core::math::log_softmax;

use super::{ModelError, ModelResult};

/// Kernel bandwidth multipliers `2^k` for `k` in `-3..=1`
pub const DEFAULT_ALPHAS: [f64; 5] = [0.125, 0.25, 0.5, 1.0, 2.0];

/// Mean cross-entropy over rows and its gradient with respect to the logits.
///
/// The gradient of one row is `(softmax(z) - onehot(y)) / n`.
pub fn cross_entropy(logits: &DMatrix<f64>, labels: &[usize]) -> ModelResult<(f64, DMatrix<f64>)> {
    let (n, k) = logits.shape();
    if n == 0 {
        return Err(ModelError::EmptyBatch);
    }
    if labels.len() != n {
        return Err(ModelError::InsufficientData(format!("{} labels for {n} logit rows", labels.len())));
    }

    let scale = 1.0 / n as f64;
    let mut grad = DMatrix::<f64>::zeros(n, k);
    let mut total = 0.0;
    for (i, (row, &label)) in logits.row_iter().zip(labels).enumerate() {
        if label >= k {
            return Err(ModelError::InsufficientData(format!("label {label} out of range for {k} classes")));
        }
        let values: Vec<f64> = row.iter().copied().collect();
        let log_p = log_softmax(&values);
        total -= log_p[label];
        for (j, lp) in log_p.iter().enumerate() {
            let target = if j == label { 1.0 } else { 0.0 };
            grad[(i, j)] = (lp.exp() - target) * scale;
        }
    }
    Ok((total * scale, grad))
}

/// MMD value and its gradients with respect to both feature batches
#[derive(Clone, Debug)]
pub struct Discrepancy {
    /// Estimated MK-MMD
    pub loss: f64,
    /// `n × d` gradient for the source features
    pub grad_source: DMatrix<f64>,
    /// `n × d` gradient for the target features
    pub grad_target: DMatrix<f64>,
}

/// Multi-kernel MMD with Gaussian kernels.
///
/// Source and target rows are stacked into one `2n × d` matrix `X`. With
/// `D_ij = |X_i - X_j|²`, kernel `k` uses `σ_k² = α_k · mean(D)` and the
/// combined kernel is `K = Σ_k exp(-D / 2σ_k²)`. The loss is
/// `Σ_ij M_ij K_ij + 2 / (n - 1)` where `M` selects the estimator:
///
/// - linear: for each `i`, pairs `(s_i, s_{i+1})` and `(t_i, t_{i+1})` weigh
///   `+1/n`, pairs `(s_i, t_{i+1})` and `(s_{i+1}, t_i)` weigh `-1/n`
/// - quadratic: `1/(n(n-1))` within a domain off the diagonal, `-1/n²`
///   across domains
///
/// Bandwidths are treated as constants when differentiating.
#[derive(Clone, Debug)]
pub struct MkMmd {
    alphas: Vec<f64>,
    linear: bool,
}

impl MkMmd {
    /// Estimator with the given kernel multipliers
    #[must_use]
    pub fn new(alphas: Vec<f64>, linear: bool) -> Self {
        Self { alphas, linear }
    }

    /// Linear or quadratic estimator with [`DEFAULT_ALPHAS`]
    #[must_use]
    pub fn with_default_kernels(linear: bool) -> Self {
        Self::new(DEFAULT_ALPHAS.to_vec(), linear)
    }

    fn stack(source: &DMatrix<f64>, target: &DMatrix<f64>) -> ModelResult<DMatrix<f64>> {
        if source.shape() != target.shape() {
            return Err(ModelError::DomainShape { source_shape: source.shape(), target: target.shape() });
        }
        let (n, d) = source.shape();
        if n < 2 {
            return Err(ModelError::InsufficientData(format!("MMD needs at least 2 rows per domain, got {n}")));
        }
        Ok(DMatrix::from_fn(2 * n, d, |i, j| if i < n { source[(i, j)] } else { target[(i - n, j)] }))
    }

    fn squared_distances(x: &DMatrix<f64>) -> DMatrix<f64> {
        let m = x.nrows();
        DMatrix::from_fn(m, m, |i, j| (x.row(i) - x.row(j)).norm_squared())
    }

    /// Squared bandwidth of every kernel for this pair of batches
    pub fn bandwidths(&self, source: &DMatrix<f64>, target: &DMatrix<f64>) -> ModelResult<Vec<f64>> {
        let distances = Self::squared_distances(&Self::stack(source, target)?);
        let mean = distances.mean().max(f64::MIN_POSITIVE);
        Ok(self.alphas.iter().map(|alpha| alpha * mean).collect())
    }

    /// Pair weights `M` for `n` rows per domain
    fn index_weights(&self, n: usize) -> DMatrix<f64> {
        let mut m = DMatrix::<f64>::zeros(2 * n, 2 * n);
        let nf = n as f64;
        if self.linear {
            for i in 0..n {
                let (s1, s2) = (i, (i + 1) % n);
                let (t1, t2) = (s1 + n, s2 + n);
                m[(s1, s2)] = 1.0 / nf;
                m[(t1, t2)] = 1.0 / nf;
                m[(s1, t2)] = -1.0 / nf;
                m[(s2, t1)] = -1.0 / nf;
            }
        } else {
            let within = 1.0 / (nf * (nf - 1.0));
            let across = -1.0 / (nf * nf);
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        m[(i, j)] = within;
                        m[(i + n, j + n)] = within;
                    }
                    m[(i, j + n)] = across;
                    m[(i + n, j)] = across;
                }
            }
        }
        m
    }

    /// Loss and gradients with bandwidths taken from the batches themselves
    pub fn evaluate(&self, source: &DMatrix<f64>, target: &DMatrix<f64>) -> ModelResult<Discrepancy> {
        let bandwidths = self.bandwidths(source, target)?;
        self.evaluate_with(source, target, &bandwidths)
    }

    /// Loss and gradients for fixed squared bandwidths
    pub fn evaluate_with(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        bandwidths: &[f64],
    ) -> ModelResult<Discrepancy> {
        let x = Self::stack(source, target)?;
        let (m, d) = x.shape();
        let n = m / 2;
        let distances = Self::squared_distances(&x);
        let weights = self.index_weights(n);

        let mut loss = 2.0 / (n as f64 - 1.0);
        let mut grad = DMatrix::<f64>::zeros(m, d);
        for i in 0..m {
            for j in 0..m {
                let pair = weights[(i, j)] + weights[(j, i)];
                let mut kernel = 0.0;
                let mut slope = 0.0;
                for &sigma_sq in bandwidths {
                    let k = (-distances[(i, j)] / (2.0 * sigma_sq)).exp();
                    kernel += k;
                    slope += k / sigma_sq;
                }
                loss += weights[(i, j)] * kernel;
                if pair != 0.0 && i != j {
                    let diff = x.row(i) - x.row(j);
                    let mut row = grad.row_mut(i);
                    row -= diff * (pair * slope);
                }
            }
        }

        Ok(Discrepancy {
            loss,
            grad_source: grad.rows(0, n).into_owned(),
            grad_target: grad.rows(n, n).into_owned(),
        })
    }
}
