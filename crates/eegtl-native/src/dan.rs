//! Deep adaptation network (DAN) training
//!
//! A freshly initialised model is trained on labelled source trials while an
//! MK-MMD term pulls the features of unlabelled target trials towards the
//! source features. Every step:
//!
//! 1. Draw a source batch and a target batch of the same size
//! 2. Forward both with batch statistics (running statistics updated)
//! 3. Loss = cross-entropy(source) + `alignment_weight` · MK-MMD(features)
//! 4. Back-propagate the target part, re-run the source batch with the same
//!    batch statistics and back-propagate the source part
//! 5. One Adam step over every parameter with the summed gradients

use nalgebra::DMatrix;
use tracing::{debug, info};

use eegtl_core::config::DanConfig;
use eegtl_core::types::Trial;

use crate::data::CyclicBatches;
use crate::experiment::ExperimentResult;
use crate::model::{cross_entropy, Adam, Classifier, MkMmd, ModelError, ModelResult, NormMode};

/// Method name used for DAN result files
pub const DAN_METHOD: &str = "DAN";

/// Losses of one training step
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DanStep {
    /// Source cross-entropy
    pub classification: f64,
    /// Unweighted MK-MMD between source and target features
    pub alignment: f64,
}

/// Optimizer and objective for one training run
#[derive(Debug)]
pub struct DanTrainer {
    optimizer: Adam,
    mmd: MkMmd,
    alignment_weight: f64,
}

impl DanTrainer {
    /// Unfreeze every parameter of `model` and create Adam over all of them
    pub fn new(model: &mut dyn Classifier, config: &DanConfig) -> Self {
        model.parameters_mut().unfreeze_all();
        Self {
            optimizer: Adam::new(model.parameters().trainable_names(), config.lr),
            mmd: MkMmd::with_default_kernels(config.linear),
            alignment_weight: config.alignment_weight,
        }
    }

    /// One update on a labelled source batch and an unlabelled target batch.
    ///
    /// The model is left in running-statistics mode.
    pub fn step(
        &mut self,
        model: &mut dyn Classifier,
        source: &[DMatrix<f64>],
        labels: &[usize],
        target: &[DMatrix<f64>],
    ) -> ModelResult<DanStep> {
        model.set_norm_mode(NormMode::BatchTracked);
        let result = self.update(model, source, labels, target);
        model.set_norm_mode(NormMode::Running);
        result
    }

    fn update(
        &mut self,
        model: &mut dyn Classifier,
        source: &[DMatrix<f64>],
        labels: &[usize],
        target: &[DMatrix<f64>],
    ) -> ModelResult<DanStep> {
        let source_out = model.forward(source)?;
        let target_out = model.forward(target)?;

        let (classification, grad_logits) = cross_entropy(&source_out.logits, labels)?;
        let discrepancy = self.mmd.evaluate(&source_out.features, &target_out.features)?;

        // the target pass is the cached one
        let no_logit_grad = DMatrix::zeros(target_out.logits.nrows(), target_out.logits.ncols());
        let mut grads = model.backward(&no_logit_grad, Some(&(discrepancy.grad_target * self.alignment_weight)))?;

        model.set_norm_mode(NormMode::Batch);
        model.forward(source)?;
        let source_grads = model.backward(&grad_logits, Some(&(discrepancy.grad_source * self.alignment_weight)))?;
        grads.accumulate(&source_grads)?;

        self.optimizer.step(model.parameters_mut(), &grads)?;
        Ok(DanStep { classification, alignment: discrepancy.loss })
    }
}

fn labels_of(trials: &[Trial]) -> ModelResult<Vec<usize>> {
    trials
        .iter()
        .enumerate()
        .map(|(i, t)| t.label.ok_or_else(|| ModelError::InsufficientData(format!("source trial {i} has no label"))))
        .collect()
}

/// Train `model` with DAN for `config.epochs` passes over the source.
///
/// Both domains are drawn with [`CyclicBatches`] at a common batch size of
/// `min(batch_size, |source|, |target|)`. Returns the losses of every step.
pub fn train_dan(
    model: &mut dyn Classifier,
    source: &[Trial],
    target: &[Trial],
    config: &DanConfig,
    seed: u64,
) -> ExperimentResult<Vec<DanStep>> {
    config.validate()?;
    let labels = labels_of(source)?;
    let batch_size = config.batch_size.min(source.len()).min(target.len());
    if batch_size < 2 {
        return Err(ModelError::InsufficientData(format!(
            "DAN needs 2 trials per domain, got {} source and {} target",
            source.len(),
            target.len()
        ))
        .into());
    }

    let mut source_batches = CyclicBatches::new(source.len(), batch_size, seed)?;
    let mut target_batches = CyclicBatches::new(target.len(), batch_size, seed.wrapping_add(1))?;
    let per_epoch = source.len() / source_batches.batch_size();
    let iterations = config.epochs * per_epoch;

    let mut trainer = DanTrainer::new(model, config);
    let mut history = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let (Some(s), Some(t)) = (source_batches.next(), target_batches.next()) else {
            break;
        };
        let source_batch: Vec<DMatrix<f64>> = s.iter().map(|&i| source[i].data.clone()).collect();
        let batch_labels: Vec<usize> = s.iter().map(|&i| labels[i]).collect();
        let target_batch: Vec<DMatrix<f64>> = t.iter().map(|&i| target[i].data.clone()).collect();

        let step = trainer.step(model, &source_batch, &batch_labels, &target_batch)?;
        if history.len() % per_epoch == 0 {
            debug!(
                epoch = source_batches.epoch(),
                classification = step.classification,
                alignment = step.alignment,
                "DAN step"
            );
        }
        history.push(step);
    }

    if let Some(last) = history.last() {
        info!(
            steps = history.len(),
            batch_size,
            classification = last.classification,
            alignment = last.alignment,
            "DAN training finished"
        );
    }
    Ok(history)
}

/// MK-MMD between the features of two equally sized trial sets, with batch
/// statistics taken per domain as during training
pub fn feature_discrepancy(
    model: &mut dyn Classifier,
    source: &[Trial],
    target: &[Trial],
    linear: bool,
) -> ModelResult<f64> {
    let source_batch: Vec<DMatrix<f64>> = source.iter().map(|t| t.data.clone()).collect();
    let target_batch: Vec<DMatrix<f64>> = target.iter().map(|t| t.data.clone()).collect();

    let previous = model.norm_mode();
    model.set_norm_mode(NormMode::Batch);
    let features = model
        .forward(&source_batch)
        .and_then(|s| model.forward(&target_batch).map(|t| (s.features, t.features)));
    model.set_norm_mode(previous);
    let (source_features, target_features) = features?;

    Ok(MkMmd::with_default_kernels(linear).evaluate(&source_features, &target_features)?.loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogVarNet;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const CHANNELS: usize = 4;

    /// Labels live in the power of channels 0 and 1. Target trials carry an
    /// extra per-trial burst on channel 2 that source trials lack.
    fn domain(n: usize, nuisance: bool, seed: u64) -> Vec<Trial> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|k| {
                let label = k % 2;
                let burst = if nuisance { rng.gen_range(1.0..6.0) } else { 1.0 };
                let data = DMatrix::from_fn(CHANNELS, 64, |c, _| {
                    let gain = match c {
                        _ if c == label => 2.5,
                        2 => burst,
                        _ => 1.0,
                    };
                    gain * rng.gen_range(-1.0..1.0)
                });
                Trial::new(data, label)
            })
            .collect()
    }

    #[test]
    fn test_step_moves_every_parameter_group() {
        let source = domain(8, false, 1);
        let target = domain(8, true, 2);
        let mut model = LogVarNet::new(CHANNELS, 2, 3);
        let before = model.parameters().state_dict();

        let mut trainer = DanTrainer::new(&mut model, &DanConfig { lr: 0.01, ..DanConfig::default() });
        let s: Vec<DMatrix<f64>> = source.iter().map(|t| t.data.clone()).collect();
        let t: Vec<DMatrix<f64>> = target.iter().map(|t| t.data.clone()).collect();
        let labels: Vec<usize> = source.iter().map(|t| t.label.unwrap()).collect();
        let step = trainer.step(&mut model, &s, &labels, &t).unwrap();

        assert!(step.classification.is_finite() && step.alignment.is_finite());
        assert_eq!(model.norm_mode(), NormMode::Running);
        let after = model.parameters().state_dict();
        for name in ["spatial.weight", "norm.weight", "norm.bias", "head.weight", "head.bias"] {
            assert_ne!(after[name], before[name], "{name} did not move");
        }
        // running statistics track both domains
        assert_ne!(after["norm.running_mean"], before["norm.running_mean"]);
    }

    #[test]
    fn test_training_reduces_feature_discrepancy() {
        let source = domain(48, false, 4);
        let target = domain(48, true, 5);
        let mut model = LogVarNet::new(CHANNELS, 2, 6);
        let config = DanConfig { batch_size: 16, epochs: 60, lr: 0.01, alignment_weight: 5.0, linear: true };

        let before = feature_discrepancy(&mut model, &source, &target, false).unwrap();
        let history = train_dan(&mut model, &source, &target, &config, 7).unwrap();
        let after = feature_discrepancy(&mut model, &source, &target, false).unwrap();

        assert_eq!(history.len(), 60 * 3);
        assert!(after < before, "MMD went from {before} to {after}");
    }

    #[test]
    fn test_unlabelled_source_rejected() {
        let mut source = domain(4, false, 1);
        source[2].label = None;
        let mut model = LogVarNet::new(CHANNELS, 2, 1);
        assert!(train_dan(&mut model, &source, &domain(4, true, 2), &DanConfig::default(), 1).is_err());
    }

    #[test]
    fn test_tiny_target_rejected() {
        let mut model = LogVarNet::new(CHANNELS, 2, 1);
        let err = train_dan(&mut model, &domain(8, false, 1), &domain(1, true, 2), &DanConfig::default(), 1);
        assert!(err.is_err());
    }
}
