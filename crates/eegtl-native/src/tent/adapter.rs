//! Entropy minimization
//!
//! Each adaptation pass takes `steps` Adam steps on the mean Shannon entropy
//! of the window's predictions, then re-runs the window with the updated
//! parameters to produce the returned probabilities.

use nalgebra::DMatrix;
use tracing::{debug, info};

use eegtl_core::config::TentConfig;
use eegtl_core::math::{log_softmax, softmax_rows};

use crate::model::{Adam, Classifier, NormMode};

use super::error::TentResult;

/// Mean entropy over rows of `logits` and its gradient with respect to them.
///
/// For one row, `∂H/∂z_j = −p_j (log p_j + H)`.
pub fn mean_entropy(logits: &DMatrix<f64>) -> (f64, DMatrix<f64>) {
    let (n, k) = logits.shape();
    let mut grad = DMatrix::<f64>::zeros(n, k);
    if n == 0 {
        return (0.0, grad);
    }
    let scale = 1.0 / n as f64;
    let mut total = 0.0;
    for (i, row) in logits.row_iter().enumerate() {
        let values: Vec<f64> = row.iter().copied().collect();
        let log_p = log_softmax(&values);
        let h: f64 = log_p.iter().map(|lp| -lp.exp() * lp).sum();
        total += h;
        for (j, lp) in log_p.iter().enumerate() {
            grad[(i, j)] = -lp.exp() * (lp + h) * scale;
        }
    }
    (total * scale, grad)
}

/// Result of one adaptation pass
#[derive(Clone, Debug)]
pub struct Adaptation {
    /// `n × class_num` probabilities after the update
    pub probabilities: DMatrix<f64>,
    /// Mean entropy before the first step
    pub entropy: f64,
}

/// Owns the optimizer over the locked adaptable subset
#[derive(Debug)]
pub struct EntropyAdapter {
    optimizer: Adam,
    steps: usize,
    passes: usize,
}

impl EntropyAdapter {
    /// Prepare `model` for adaptation.
    ///
    /// Normalization switches to batch statistics without running-stat
    /// updates, every parameter outside the model's adaptable list is frozen,
    /// and a fresh Adam is created over exactly that list.
    pub fn activate(model: &mut dyn Classifier, config: &TentConfig) -> TentResult<Self> {
        let adaptable = model.adaptable_parameters();
        model.parameters_mut().freeze_all_except(&adaptable)?;
        model.set_norm_mode(NormMode::Batch);
        info!(params = ?adaptable, lr = config.lr, steps = config.steps, "Tent adaptation activated");
        Ok(Self {
            optimizer: Adam::new(adaptable, config.lr),
            steps: config.steps,
            passes: 0,
        })
    }

    /// Run one adaptation pass on `batch` and predict it
    pub fn adapt(&mut self, model: &mut dyn Classifier, batch: &[DMatrix<f64>]) -> TentResult<Adaptation> {
        let mut entropy = None;
        for _ in 0..self.steps {
            let out = model.forward(batch)?;
            let (loss, grad) = mean_entropy(&out.logits);
            entropy.get_or_insert(loss);
            let grads = model.backward(&grad, None)?;
            self.optimizer.step(model.parameters_mut(), &grads)?;
        }
        let out = model.forward(batch)?;
        self.passes += 1;
        let entropy = entropy.unwrap_or_else(|| mean_entropy(&out.logits).0);
        debug!(pass = self.passes, entropy, "adaptation pass");
        Ok(Adaptation {
            probabilities: softmax_rows(&out.logits),
            entropy,
        })
    }

    /// Adaptation passes run so far
    pub fn passes(&self) -> usize {
        self.passes
    }
}
