//! Leave-one-subject-out experiment runner
//!
//! For every seed and held-out subject:
//!
//! 1. Load the source checkpoint (missing files are fatal)
//! 2. Optionally score the target offline with whole-subject alignment
//! 3. Stream the target without adaptation (online alignment baseline)
//! 4. Stream the target with Tent on a freshly loaded model
//! 5. Save the adapted snapshot and append the exported predictions
//!
//! Scores are converted to percent, aggregated over seeds and appended to the
//! method's CSV.
//! [`ExperimentRunner::calibrate`] produces the source checkpoints and
//! [`ExperimentRunner::dan`] trains one DAN model per fold instead.

use std::path::PathBuf;

use nalgebra::DMatrix;
use thiserror::Error;
use tracing::{info, warn};

use eegtl_core::config::{CalibrationConfig, EvaluationPolicy, ExperimentConfig};
use eegtl_core::error::CoreError;
use eegtl_core::math::{argmax, softmax_rows};
use eegtl_core::metrics::{accuracy, roc_auc};
use eegtl_core::types::{SubjectId, Trial};

use crate::alignment::euclidean_align;
use crate::dan::{feature_discrepancy, train_dan, DAN_METHOD};
use crate::data::{imbalance, CyclicBatches, DataError, DatasetLoader, SubjectTrials};
use crate::model::{
    build_classifier, load_checkpoint, save_checkpoint, CheckpointKey, Classifier, LogVarNet, ModelError,
    ModelResult, NormMode,
};
use crate::report::{append_predictions, append_summary, percent, summarize, ReportError, Summary};
use crate::tent::{TentError, TentSession};

/// Trials per forward pass during offline scoring
const OFFLINE_CHUNK: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that abort an experiment
#[derive(Error, Debug)]
pub enum ExperimentError {
    /// Invalid configuration or metric input
    #[error(transparent)]
    Config(#[from] CoreError),

    /// Dataset problem
    #[error(transparent)]
    Data(#[from] DataError),

    /// Model or checkpoint problem
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Online session aborted
    #[error(transparent)]
    Tent(#[from] TentError),

    /// Result files could not be written
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Result type for experiments
pub type ExperimentResult<T> = Result<T, ExperimentError>;

// ============================================================================
// Results
// ============================================================================

/// Scores for one held-out subject under one seed, in percent
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectResult {
    /// Held-out subject
    pub subject: SubjectId,
    /// Offline whole-subject alignment score, when requested
    pub offline: Option<f64>,
    /// Online alignment without adaptation
    pub baseline: f64,
    /// Online alignment with Tent
    pub tent: f64,
    /// Trials streamed
    pub trials: usize,
    /// Trials predicted after adaptation
    pub adapted: usize,
}

/// All subjects under one seed
#[derive(Clone, Debug, PartialEq)]
pub struct SeedResult {
    /// Seed
    pub seed: u64,
    /// Per-subject scores in subject order
    pub subjects: Vec<SubjectResult>,
}

impl SeedResult {
    fn tent_scores(&self) -> Vec<f64> {
        self.subjects.iter().map(|s| s.tent).collect()
    }

    fn baseline_scores(&self) -> Vec<f64> {
        self.subjects.iter().map(|s| s.baseline).collect()
    }
}

/// Outcome of a full run
#[derive(Clone, Debug)]
pub struct ExperimentReport {
    /// Per-seed results
    pub seeds: Vec<SeedResult>,
    /// Tent aggregate
    pub summary: Summary,
    /// Non-adaptive online aggregate
    pub baseline: Summary,
    /// Summary CSV that received the Tent row
    pub summary_path: PathBuf,
}

/// Outcome of a DAN run
#[derive(Clone, Debug)]
pub struct DanReport {
    /// Target scores in percent, `[seed][subject]`
    pub per_seed: Vec<Vec<f64>>,
    /// Aggregate appended to the DAN CSV
    pub summary: Summary,
    /// Summary CSV that received the row
    pub summary_path: PathBuf,
}

// ============================================================================
// Runner
// ============================================================================

/// Runs experiments described by one [`ExperimentConfig`]
#[derive(Clone, Debug)]
pub struct ExperimentRunner {
    config: ExperimentConfig,
}

impl ExperimentRunner {
    /// Validate and take ownership of the configuration
    pub fn new(config: ExperimentConfig) -> ExperimentResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Checkpoint location for a subject and seed
    pub fn checkpoint_key(&self, subject: SubjectId, seed: u64, adapted: bool) -> CheckpointKey {
        CheckpointKey {
            dataset: self.config.dataset,
            backbone: self.config.backbone,
            subject,
            seed,
            aligned: self.config.tent.align,
            adapted,
        }
    }

    fn load_data(&self) -> ExperimentResult<SubjectTrials> {
        Ok(DatasetLoader::new(&self.config.data_path, self.config.dataset).load()?)
    }

    fn fresh_model(&self, seed: u64) -> Box<dyn Classifier> {
        let spec = self.config.spec();
        build_classifier(self.config.backbone, spec.channels, spec.class_num, seed)
    }

    fn source_model(&self, subject: SubjectId, seed: u64) -> ExperimentResult<Box<dyn Classifier>> {
        let mut model = self.fresh_model(seed);
        load_checkpoint(model.as_mut(), &self.checkpoint_key(subject, seed, false), &self.config.runs_path)?;
        Ok(model)
    }

    /// Fit and save a source checkpoint for every seed and held-out subject
    pub fn calibrate(&self) -> ExperimentResult<Vec<PathBuf>> {
        let data = self.load_data()?;
        let spec = self.config.spec();
        let mut written = Vec::new();
        for &seed in &self.config.seeds {
            for subject in data.subjects() {
                let fold = data.fold(subject.id, self.config.tent.align, self.config.tent.covariance)?;
                let mut model = LogVarNet::new(spec.channels, spec.class_num, seed);
                calibrate_source(&mut model, &fold.source, &self.config.calibration, seed)?;
                let source_accuracy =
                    percent(offline_score(&mut model, &fold.source, EvaluationPolicy::Balanced, spec.class_num)?);
                info!(seed, subject = %subject.id, source_trials = fold.source.len(), source_accuracy, "calibrated source model");
                written.push(save_checkpoint(&model, &self.checkpoint_key(subject.id, seed, false), &self.config.runs_path)?);
            }
        }
        Ok(written)
    }

    /// Run every seed and subject, then append the aggregate
    pub fn run(&self) -> ExperimentResult<ExperimentReport> {
        let data = self.load_data()?;
        let mut seeds = Vec::with_capacity(self.config.seeds.len());
        for &seed in &self.config.seeds {
            info!(seed, method = %self.config.method, dataset = %self.config.dataset, "starting seed");
            let mut subjects = Vec::with_capacity(data.subjects().len());
            for subject in data.subjects() {
                subjects.push(self.run_subject(subject.id, &subject.trials, seed)?);
            }
            let result = SeedResult { seed, subjects };
            let tent = result.tent_scores();
            info!(seed, mean = tent.iter().sum::<f64>() / tent.len().max(1) as f64, "seed finished");
            seeds.push(result);
        }

        let name = self.config.dataset.name();
        let per_seed: Vec<Vec<f64>> = seeds.iter().map(SeedResult::tent_scores).collect();
        let summary = summarize(name, &per_seed)?;
        let baseline_scores: Vec<Vec<f64>> = seeds.iter().map(SeedResult::baseline_scores).collect();
        let baseline = summarize(name, &baseline_scores)?;
        info!(
            avg = summary.total_mean,
            std = summary.total_std,
            baseline_avg = baseline.total_mean,
            "{} on {}",
            self.config.method,
            name
        );
        let summary_path = append_summary(&self.config.log_path, &self.config.method, &summary)?;
        Ok(ExperimentReport { seeds, summary, baseline, summary_path })
    }

    /// Train DAN on every fold and score the whole held-out subject offline.
    ///
    /// Target trials are aligned with their own mean covariance when
    /// alignment is enabled, the way source subjects are.
    pub fn dan(&self) -> ExperimentResult<DanReport> {
        let data = self.load_data()?;
        let name = data.dataset().name();
        let policy = self.config.tent.policy;
        let class_num = self.config.spec().class_num;

        let mut per_seed = Vec::with_capacity(self.config.seeds.len());
        for &seed in &self.config.seeds {
            info!(seed, method = DAN_METHOD, dataset = %data.dataset(), "starting seed");
            let mut scores = Vec::with_capacity(data.subjects().len());
            for subject in data.subjects() {
                let fold = data.fold(subject.id, self.config.tent.align, self.config.tent.covariance)?;
                let target = match policy {
                    EvaluationPolicy::Balanced => fold.target,
                    EvaluationPolicy::Imbalanced => imbalance(&fold.target),
                };
                let target = if self.config.tent.align {
                    euclidean_align(&target, self.config.tent.covariance)?
                } else {
                    target
                };

                let mut model = self.fresh_model(seed);
                train_dan(model.as_mut(), &fold.source, &target, &self.config.dan, seed)?;
                let paired = fold.source.len().min(target.len());
                let mmd = feature_discrepancy(
                    model.as_mut(),
                    &fold.source[..paired],
                    &target[..paired],
                    self.config.dan.linear,
                )?;
                let score = percent(offline_score(model.as_mut(), &target, policy, class_num)?);
                info!(seed, subject = %subject.id, score, mmd, "{} after DAN", policy.metric_name());
                scores.push(score);
            }
            per_seed.push(scores);
        }

        let summary = summarize(name, &per_seed)?;
        info!(avg = summary.total_mean, std = summary.total_std, "{DAN_METHOD} on {name}");
        let summary_path = append_summary(&self.config.log_path, DAN_METHOD, &summary)?;
        Ok(DanReport { per_seed, summary, summary_path })
    }

    fn run_subject(&self, subject: SubjectId, trials: &[Trial], seed: u64) -> ExperimentResult<SubjectResult> {
        let tent_config = &self.config.tent;
        let class_num = self.config.spec().class_num;
        info!("Transfer to {} ({})", subject, subject.task_label());

        let stream = match tent_config.policy {
            EvaluationPolicy::Balanced => trials.to_vec(),
            EvaluationPolicy::Imbalanced => imbalance(trials),
        };
        if stream.is_empty() {
            warn!(subject = %subject, "no target trials");
        }

        let mut model = self.source_model(subject, seed)?;

        let offline = if self.config.offline_eval {
            let target = if tent_config.align {
                euclidean_align(&stream, tent_config.covariance)?
            } else {
                stream.clone()
            };
            Some(percent(offline_score(model.as_mut(), &target, tent_config.policy, class_num)?))
        } else {
            None
        };

        let baseline_outcome = TentSession::baseline(model.as_mut(), tent_config)?.run(stream.iter().cloned())?;
        let baseline = percent(baseline_outcome.score(tent_config.policy, class_num)?);

        let mut model = self.source_model(subject, seed)?;
        let outcome = TentSession::new(model.as_mut(), tent_config)?.run(stream)?;
        let tent = percent(outcome.score(tent_config.policy, class_num)?);

        save_checkpoint(model.as_ref(), &self.checkpoint_key(subject, seed, true), &self.config.runs_path)?;
        append_predictions(
            &self.config.log_path,
            self.config.dataset.name(),
            &self.config.method,
            seed,
            &outcome.export_scores(class_num),
        )?;

        let metric = tent_config.policy.metric_name();
        info!(
            subject = %subject,
            offline = ?offline,
            baseline,
            tent,
            adapted = outcome.adapted_count(),
            "{metric} after streaming"
        );
        Ok(SubjectResult {
            subject,
            offline,
            baseline,
            tent,
            trials: outcome.len(),
            adapted: outcome.adapted_count(),
        })
    }
}

// ============================================================================
// Source Fitting and Offline Scoring
// ============================================================================

/// Fit a source model without gradient training.
///
/// Normalization running statistics are calibrated by streaming
/// `config.iterations` shuffled batches in tracked batch-statistics mode, then
/// the head is fitted by shrinkage LDA.
pub fn calibrate_source(
    model: &mut LogVarNet,
    source: &[Trial],
    config: &CalibrationConfig,
    seed: u64,
) -> ExperimentResult<()> {
    config.validate()?;
    let batches = CyclicBatches::new(source.len(), config.batch_size, seed)?;

    model.parameters_mut().freeze_all_except(&[])?;
    model.set_norm_mode(NormMode::BatchTracked);
    let tracked = batches.take(config.iterations).try_for_each(|indices| -> ModelResult<()> {
        let batch: Vec<DMatrix<f64>> = indices.iter().map(|&i| source[i].data.clone()).collect();
        model.forward(&batch).map(|_| ())
    });
    model.set_norm_mode(NormMode::Running);
    model.parameters_mut().unfreeze_all();
    tracked?;

    model.fit_head_lda(source, config.shrinkage)?;
    Ok(())
}

/// Score a model on a whole labelled set with running statistics
pub fn offline_score(
    model: &mut dyn Classifier,
    trials: &[Trial],
    policy: EvaluationPolicy,
    class_num: usize,
) -> ExperimentResult<f64> {
    let labels = trials
        .iter()
        .enumerate()
        .map(|(index, t)| t.label.ok_or(TentError::UnlabeledTrial { index }))
        .collect::<Result<Vec<usize>, _>>()?;

    let previous = model.norm_mode();
    model.set_norm_mode(NormMode::Running);
    let mut probabilities: Vec<Vec<f64>> = Vec::with_capacity(trials.len());
    let scored = trials.chunks(OFFLINE_CHUNK).try_for_each(|chunk| -> ModelResult<()> {
        let batch: Vec<DMatrix<f64>> = chunk.iter().map(|t| t.data.clone()).collect();
        let probs = softmax_rows(&model.forward(&batch)?.logits);
        probabilities.extend(probs.row_iter().map(|row| row.iter().copied().collect::<Vec<f64>>()));
        Ok(())
    });
    model.set_norm_mode(previous);
    scored?;

    let score = match policy {
        EvaluationPolicy::Balanced => {
            let predicted: Vec<usize> = probabilities.iter().map(|p| argmax(p)).collect();
            accuracy(&labels, &predicted)?
        }
        EvaluationPolicy::Imbalanced => {
            policy.check_classes(class_num)?;
            let positive: Vec<f64> = probabilities.iter().map(|p| p.get(1).copied().unwrap_or(0.0)).collect();
            roc_auc(&labels, &positive)?
        }
    };
    Ok(score)
}
