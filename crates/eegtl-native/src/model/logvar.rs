//! Log-variance network
//!
//! A compact motor-imagery backbone:
//!
//! ```text
//! trial (C × T) ──► spatial filter W (F × C) ──► log-variance per filter
//!               ──► batch norm (γ, β) ──► features (F)
//!               ──► linear head (K × F) ──► logits (K)
//! ```
//!
//! The batch-norm affine pair is the declared adaptable subset. Forward and
//! backward passes are written out by hand.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use eegtl_core::config::Backbone;
use eegtl_core::types::Trial;

use super::params::{Gradients, ParameterStore, TensorData};
use super::{Classifier, ForwardOutput, ModelError, ModelResult, NormMode};

/// Default number of spatial filters
pub const DEFAULT_FILTERS: usize = 8;

/// Batch-norm variance epsilon
pub const BN_EPS: f64 = 1e-5;

/// Batch-norm running-statistics momentum
pub const BN_MOMENTUM: f64 = 0.1;

/// Added to the variance before the logarithm
pub const LOGVAR_EPS: f64 = 1e-6;

const SPATIAL_WEIGHT: &str = "spatial.weight";
const NORM_WEIGHT: &str = "norm.weight";
const NORM_BIAS: &str = "norm.bias";
const NORM_RUNNING_MEAN: &str = "norm.running_mean";
const NORM_RUNNING_VAR: &str = "norm.running_var";
const HEAD_WEIGHT: &str = "head.weight";
const HEAD_BIAS: &str = "head.bias";

/// Trials per forward pass when extracting features for a fit
const FIT_CHUNK: usize = 64;

/// Activations kept for the backward pass
struct ForwardCache {
    /// Inputs and centred filter outputs, kept only when the spatial filter learns
    signals: Option<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)>,
    /// n × F variances before the logarithm
    variance: DMatrix<f64>,
    /// n × F normalized log-variances
    xhat: DMatrix<f64>,
    /// Per-filter 1 / sqrt(var + eps) used in the pass
    inv_std: DVector<f64>,
    /// n × F features
    features: DMatrix<f64>,
    /// Whether batch statistics were used
    batch_stats: bool,
}

/// Spatial filter + log-variance + batch norm + linear head
pub struct LogVarNet {
    channels: usize,
    filters: usize,
    class_num: usize,
    store: ParameterStore,
    mode: NormMode,
    cache: Option<ForwardCache>,
}

impl LogVarNet {
    /// Create with [`DEFAULT_FILTERS`] spatial filters
    #[must_use]
    pub fn new(channels: usize, class_num: usize, seed: u64) -> Self {
        Self::with_filters(channels, class_num, DEFAULT_FILTERS, seed)
    }

    /// Create with an explicit filter count.
    ///
    /// Weights are drawn uniformly from ±1/√fan_in with a seeded generator, so
    /// equal seeds give equal models.
    #[must_use]
    pub fn with_filters(channels: usize, class_num: usize, filters: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut uniform = |count: usize, fan_in: usize| -> Vec<f64> {
            let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
            (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let spatial = uniform(filters * channels, channels);
        let head = uniform(class_num * filters, filters);
        let head_bias = uniform(class_num, filters);

        let mut store = ParameterStore::new();
        store.register_parameter(SPATIAL_WEIGHT, TensorData { rows: filters, cols: channels, values: spatial });
        store.register_parameter(NORM_WEIGHT, TensorData::filled(1, filters, 1.0));
        store.register_parameter(NORM_BIAS, TensorData::filled(1, filters, 0.0));
        store.register_buffer(NORM_RUNNING_MEAN, TensorData::filled(1, filters, 0.0));
        store.register_buffer(NORM_RUNNING_VAR, TensorData::filled(1, filters, 1.0));
        store.register_parameter(HEAD_WEIGHT, TensorData { rows: class_num, cols: filters, values: head });
        store.register_parameter(HEAD_BIAS, TensorData { rows: 1, cols: class_num, values: head_bias });

        Self {
            channels,
            filters,
            class_num,
            store,
            mode: NormMode::Running,
            cache: None,
        }
    }

    fn matrix(&self, name: &str) -> ModelResult<DMatrix<f64>> {
        let t = self.store.get(name)?;
        Ok(DMatrix::from_row_slice(t.rows, t.cols, &t.values))
    }

    fn vector(&self, name: &str) -> ModelResult<DVector<f64>> {
        Ok(DVector::from_column_slice(&self.store.get(name)?.values))
    }

    /// Features of many trials, computed in chunks with running statistics
    pub fn extract_features(&mut self, trials: &[Trial]) -> ModelResult<DMatrix<f64>> {
        if trials.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        let previous = self.mode;
        self.mode = NormMode::Running;
        let mut rows: Vec<f64> = Vec::with_capacity(trials.len() * self.filters);
        let result = trials.chunks(FIT_CHUNK).try_for_each(|chunk| -> ModelResult<()> {
            let batch: Vec<DMatrix<f64>> = chunk.iter().map(|t| t.data.clone()).collect();
            let out = self.forward(&batch)?;
            rows.extend_from_slice(&row_major(&out.features));
            Ok(())
        });
        self.mode = previous;
        result?;
        Ok(DMatrix::from_row_slice(trials.len(), self.filters, &rows))
    }

    /// Fit the linear head by shrinkage linear discriminant analysis.
    ///
    /// Features are taken with running statistics. The pooled within-class
    /// covariance is shrunk towards `trace/F · I` by `shrinkage` in `[0, 1]`.
    /// Every trial must be labelled.
    pub fn fit_head_lda(&mut self, trials: &[Trial], shrinkage: f64) -> ModelResult<()> {
        let labels = trials
            .iter()
            .enumerate()
            .map(|(i, t)| t.label.ok_or_else(|| ModelError::InsufficientData(format!("trial {i} has no label"))))
            .collect::<ModelResult<Vec<usize>>>()?;
        let features = self.extract_features(trials)?;
        let (n, f, k) = (features.nrows(), self.filters, self.class_num);

        let mut counts = vec![0usize; k];
        let mut means = DMatrix::<f64>::zeros(k, f);
        for (i, &label) in labels.iter().enumerate() {
            if label >= k {
                return Err(ModelError::InsufficientData(format!("label {label} out of range for {k} classes")));
            }
            counts[label] += 1;
            for j in 0..f {
                means[(label, j)] += features[(i, j)];
            }
        }
        if let Some(missing) = counts.iter().position(|&c| c == 0) {
            return Err(ModelError::InsufficientData(format!("no trials for class {missing}")));
        }
        for (c, &count) in counts.iter().enumerate() {
            for j in 0..f {
                means[(c, j)] /= count as f64;
            }
        }

        let mut scatter = DMatrix::<f64>::zeros(f, f);
        for (i, &label) in labels.iter().enumerate() {
            let d = DVector::from_fn(f, |j, _| features[(i, j)] - means[(label, j)]);
            scatter += &d * d.transpose();
        }
        let dof = if n > k { n - k } else { n };
        scatter /= dof as f64;

        let lambda = shrinkage.clamp(0.0, 1.0);
        let target = (scatter.trace() / f as f64).max(f64::EPSILON);
        let shrunk = scatter * (1.0 - lambda) + DMatrix::identity(f, f) * (lambda * target);
        let chol = Cholesky::new(shrunk).ok_or(ModelError::Singular { operation: "lda covariance" })?;

        let mut weight = Vec::with_capacity(k * f);
        let mut bias = Vec::with_capacity(k);
        for c in 0..k {
            let mu = means.row(c).transpose();
            let w = chol.solve(&mu);
            bias.push(-0.5 * mu.dot(&w) + (counts[c] as f64 / n as f64).ln());
            weight.extend(w.iter());
        }
        self.store.get_mut(HEAD_WEIGHT)?.values = weight;
        self.store.get_mut(HEAD_BIAS)?.values = bias;
        debug!(trials = n, classes = k, shrinkage = lambda, "fitted LDA head");
        Ok(())
    }
}

/// Row-major copy of a column-major matrix
fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    m.transpose().as_slice().to_vec()
}

impl Classifier for LogVarNet {
    fn backbone(&self) -> Backbone {
        Backbone::LogVarNet
    }

    fn class_num(&self) -> usize {
        self.class_num
    }

    fn forward(&mut self, batch: &[DMatrix<f64>]) -> ModelResult<ForwardOutput> {
        let n = batch.len();
        if n == 0 {
            return Err(ModelError::EmptyBatch);
        }
        let batch_stats = self.mode.uses_batch_stats();
        if batch_stats && n < 2 {
            return Err(ModelError::BatchTooSmall { got: n });
        }
        for (index, x) in batch.iter().enumerate() {
            if x.nrows() != self.channels {
                return Err(ModelError::ChannelMismatch { index, got: x.nrows(), expected: self.channels });
            }
            if x.ncols() == 0 {
                return Err(ModelError::InsufficientData(format!("trial {index} has no samples")));
            }
        }

        let f = self.filters;
        let w = self.matrix(SPATIAL_WEIGHT)?;
        let keep_signals = self.store.requires_grad(SPATIAL_WEIGHT);

        let mut variance = DMatrix::<f64>::zeros(n, f);
        let mut log_var = DMatrix::<f64>::zeros(n, f);
        let mut centred_all = Vec::with_capacity(if keep_signals { n } else { 0 });
        for (i, x) in batch.iter().enumerate() {
            let mut z = &w * x;
            let t = x.ncols() as f64;
            for (j, mut row) in z.row_iter_mut().enumerate() {
                let mean = row.mean();
                row.add_scalar_mut(-mean);
                let v = row.norm_squared() / t;
                variance[(i, j)] = v;
                log_var[(i, j)] = (v + LOGVAR_EPS).ln();
            }
            if keep_signals {
                centred_all.push(z);
            }
        }

        let (mean, var) = if batch_stats {
            let mean = DVector::from_fn(f, |j, _| log_var.column(j).mean());
            let var = DVector::from_fn(f, |j, _| {
                log_var.column(j).iter().map(|v| (v - mean[j]).powi(2)).sum::<f64>() / n as f64
            });
            (mean, var)
        } else {
            (self.vector(NORM_RUNNING_MEAN)?, self.vector(NORM_RUNNING_VAR)?)
        };
        let inv_std = var.map(|v| 1.0 / (v + BN_EPS).sqrt());

        let gamma = self.vector(NORM_WEIGHT)?;
        let beta = self.vector(NORM_BIAS)?;
        let xhat = DMatrix::from_fn(n, f, |i, j| (log_var[(i, j)] - mean[j]) * inv_std[j]);
        let features = DMatrix::from_fn(n, f, |i, j| gamma[j] * xhat[(i, j)] + beta[j]);

        let head = self.matrix(HEAD_WEIGHT)?;
        let head_bias = self.vector(HEAD_BIAS)?;
        let mut logits = &features * head.transpose();
        for mut row in logits.row_iter_mut() {
            for (value, b) in row.iter_mut().zip(head_bias.iter()) {
                *value += b;
            }
        }

        if self.mode == NormMode::BatchTracked {
            let unbiased = n as f64 / (n - 1) as f64;
            let running_mean = self.store.get_mut(NORM_RUNNING_MEAN)?;
            for (rm, m) in running_mean.values.iter_mut().zip(mean.iter()) {
                *rm = (1.0 - BN_MOMENTUM) * *rm + BN_MOMENTUM * m;
            }
            let running_var = self.store.get_mut(NORM_RUNNING_VAR)?;
            for (rv, v) in running_var.values.iter_mut().zip(var.iter()) {
                *rv = (1.0 - BN_MOMENTUM) * *rv + BN_MOMENTUM * v * unbiased;
            }
        }

        self.cache = Some(ForwardCache {
            signals: keep_signals.then(|| (batch.to_vec(), centred_all)),
            variance,
            xhat,
            inv_std,
            features: features.clone(),
            batch_stats,
        });

        Ok(ForwardOutput { features, logits })
    }

    fn backward(
        &mut self,
        grad_logits: &DMatrix<f64>,
        grad_features: Option<&DMatrix<f64>>,
    ) -> ModelResult<Gradients> {
        let cache = self.cache.as_ref().ok_or(ModelError::NoForwardCache)?;
        let (n, f) = cache.features.shape();
        if grad_logits.shape() != (n, self.class_num) {
            return Err(ModelError::GradientShape { expected: (n, self.class_num), got: grad_logits.shape() });
        }
        if let Some(g) = grad_features {
            if g.shape() != (n, f) {
                return Err(ModelError::GradientShape { expected: (n, f), got: g.shape() });
            }
        }

        let mut grads = Gradients::new();
        let head = self.matrix(HEAD_WEIGHT)?;

        if self.store.requires_grad(HEAD_WEIGHT) {
            grads.insert(HEAD_WEIGHT, row_major(&(grad_logits.transpose() * &cache.features)));
        }
        if self.store.requires_grad(HEAD_BIAS) {
            let db: Vec<f64> = grad_logits.column_iter().map(|c| c.sum()).collect();
            grads.insert(HEAD_BIAS, db);
        }

        let mut dh = grad_logits * &head;
        if let Some(g) = grad_features {
            dh += g;
        }

        if self.store.requires_grad(NORM_WEIGHT) {
            let dgamma: Vec<f64> = (0..f)
                .map(|j| dh.column(j).iter().zip(cache.xhat.column(j).iter()).map(|(a, b)| a * b).sum())
                .collect();
            grads.insert(NORM_WEIGHT, dgamma);
        }
        if self.store.requires_grad(NORM_BIAS) {
            let dbeta: Vec<f64> = dh.column_iter().map(|c| c.sum()).collect();
            grads.insert(NORM_BIAS, dbeta);
        }

        if let Some((inputs, centred)) = cache.signals.as_ref().filter(|_| self.store.requires_grad(SPATIAL_WEIGHT)) {
            let gamma = self.vector(NORM_WEIGHT)?;
            let dxhat = DMatrix::from_fn(n, f, |i, j| dh[(i, j)] * gamma[j]);

            let dlog_var = if cache.batch_stats {
                let nf = n as f64;
                let mut out = DMatrix::<f64>::zeros(n, f);
                for j in 0..f {
                    let s1: f64 = dxhat.column(j).sum();
                    let s2: f64 = dxhat.column(j).iter().zip(cache.xhat.column(j).iter()).map(|(a, b)| a * b).sum();
                    for i in 0..n {
                        out[(i, j)] = cache.inv_std[j] / nf * (nf * dxhat[(i, j)] - s1 - cache.xhat[(i, j)] * s2);
                    }
                }
                out
            } else {
                DMatrix::from_fn(n, f, |i, j| dxhat[(i, j)] * cache.inv_std[j])
            };

            let mut dw = DMatrix::<f64>::zeros(f, self.channels);
            for (i, (x, zc)) in inputs.iter().zip(centred).enumerate() {
                let scale = 2.0 / x.ncols() as f64;
                let mut weighted = zc.clone();
                for (j, mut row) in weighted.row_iter_mut().enumerate() {
                    row *= scale * dlog_var[(i, j)] / (cache.variance[(i, j)] + LOGVAR_EPS);
                }
                dw += weighted * x.transpose();
            }
            grads.insert(SPATIAL_WEIGHT, row_major(&dw));
        }

        Ok(grads)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn adaptable_parameters(&self) -> Vec<String> {
        vec![NORM_WEIGHT.to_string(), NORM_BIAS.to_string()]
    }

    fn norm_mode(&self) -> NormMode {
        self.mode
    }

    fn set_norm_mode(&mut self, mode: NormMode) {
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn trials(n: usize, channels: usize, samples: usize, seed: u64) -> Vec<DMatrix<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| DMatrix::from_fn(channels, samples, |_, _| rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn loss(model: &mut LogVarNet, batch: &[DMatrix<f64>], logit_weights: &DMatrix<f64>, feature_weights: &DMatrix<f64>) -> f64 {
        let out = model.forward(batch).unwrap();
        out.logits.component_mul(logit_weights).sum() + out.features.component_mul(feature_weights).sum()
    }

    /// Compare analytic gradients against central differences for a linear
    /// functional of the logits and the features.
    fn check_gradients(mode: NormMode) {
        let mut model = LogVarNet::with_filters(3, 2, 4, 7);
        model.set_norm_mode(mode);
        let batch = trials(5, 3, 40, 11);
        let logit_weights = DMatrix::from_fn(5, 2, |i, k| ((i + 2 * k) as f64 * 0.7).sin());
        let feature_weights = DMatrix::from_fn(5, 4, |i, j| ((3 * i + j) as f64 * 0.4).cos());

        model.forward(&batch).unwrap();
        let grads = model.backward(&logit_weights, Some(&feature_weights)).unwrap();

        for name in [SPATIAL_WEIGHT, NORM_WEIGHT, NORM_BIAS, HEAD_WEIGHT, HEAD_BIAS] {
            let analytic = grads.get(name).unwrap().to_vec();
            for idx in 0..analytic.len() {
                let h = 1e-6;
                let saved = model.parameters().get(name).unwrap().values[idx];
                model.parameters_mut().get_mut(name).unwrap().values[idx] = saved + h;
                let up = loss(&mut model, &batch, &logit_weights, &feature_weights);
                model.parameters_mut().get_mut(name).unwrap().values[idx] = saved - h;
                let down = loss(&mut model, &batch, &logit_weights, &feature_weights);
                model.parameters_mut().get_mut(name).unwrap().values[idx] = saved;
                let numeric = (up - down) / (2.0 * h);
                assert_relative_eq!(analytic[idx], numeric, epsilon = 1e-5, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn test_gradients_running_stats() {
        check_gradients(NormMode::Running);
    }

    #[test]
    fn test_gradients_batch_stats() {
        check_gradients(NormMode::Batch);
    }

    #[test]
    fn test_seeded_construction_is_deterministic() {
        let a = LogVarNet::new(4, 2, 3);
        let b = LogVarNet::new(4, 2, 3);
        let c = LogVarNet::new(4, 2, 4);
        assert_eq!(a.parameters().state_dict(), b.parameters().state_dict());
        assert_ne!(a.parameters().state_dict(), c.parameters().state_dict());
    }

    #[test]
    fn test_batch_mode_rejects_single_trial() {
        let mut model = LogVarNet::new(3, 2, 1);
        model.set_norm_mode(NormMode::Batch);
        let batch = trials(1, 3, 20, 1);
        assert!(matches!(model.forward(&batch), Err(ModelError::BatchTooSmall { got: 1 })));
    }

    #[test]
    fn test_running_stats_only_move_when_tracked() {
        let mut model = LogVarNet::new(3, 2, 1);
        let batch = trials(4, 3, 20, 2);
        let before = model.parameters().state_dict();

        model.set_norm_mode(NormMode::Batch);
        model.forward(&batch).unwrap();
        assert_eq!(model.parameters().state_dict(), before);

        model.set_norm_mode(NormMode::BatchTracked);
        model.forward(&batch).unwrap();
        assert_ne!(
            model.parameters().get(NORM_RUNNING_MEAN).unwrap(),
            before.get(NORM_RUNNING_MEAN).unwrap()
        );
    }

    #[test]
    fn test_frozen_parameters_get_no_gradient() {
        let mut model = LogVarNet::new(3, 2, 1);
        let adaptable = model.adaptable_parameters();
        model.parameters_mut().freeze_all_except(&adaptable).unwrap();
        model.set_norm_mode(NormMode::Batch);
        let batch = trials(4, 3, 20, 5);
        let out = model.forward(&batch).unwrap();
        let grads = model.backward(&DMatrix::from_element(4, 2, 1.0), None).unwrap();
        let names: Vec<&str> = grads.names().collect();
        assert_eq!(names, vec![NORM_BIAS, NORM_WEIGHT]);
        assert_eq!(out.features.shape(), (4, DEFAULT_FILTERS));
    }

    #[test]
    fn test_lda_head_separates_variance_classes() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut trials = Vec::new();
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for i in 0..40 {
            let label = i % 2;
            let (a, b) = if label == 0 { (3.0, 0.3) } else { (0.3, 3.0) };
            let x = DMatrix::from_fn(2, 50, |c, _| {
                let amp = if c == 0 { a } else { b };
                amp * rng.gen_range(-1.0..1.0)
            });
            trials.push(Trial::new(x.clone(), label));
            data.push(x);
            labels.push(label);
        }

        let mut model = LogVarNet::with_filters(2, 2, 2, 0);
        model.parameters_mut().get_mut(SPATIAL_WEIGHT).unwrap().values = vec![1.0, 0.0, 0.0, 1.0];
        model.fit_head_lda(&trials, 0.1).unwrap();
        assert!(model.fit_head_lda(&[Trial::unlabeled(data[0].clone())], 0.1).is_err());

        let out = model.forward(&data).unwrap();
        let correct = (0..data.len())
            .filter(|&i| {
                let pred = usize::from(out.logits[(i, 1)] > out.logits[(i, 0)]);
                pred == labels[i]
            })
            .count();
        assert!(correct >= 38, "only {correct}/40 correct");
    }
}
