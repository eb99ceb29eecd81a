//! Online inference driver
//!
//! Consumes a target stream once, in arrival order. For every trial:
//!
//! 1. Ask the trigger for a decision (fatal stride errors surface here)
//! 2. Fold the trial into the running alignment reference
//! 3. Append the raw trial to the buffer
//! 4. Cold: predict the single aligned trial with the unmodified model;
//!    Adapting: re-align the window with the current transform, run one
//!    adaptation pass, keep the last row
//! 5. Record the label and the prediction together, only on success

use std::time::Instant;

use nalgebra::DMatrix;
use tracing::{debug, info};

use eegtl_core::config::{EvaluationPolicy, TentConfig};
use eegtl_core::math::{argmax, softmax_rows};
use eegtl_core::metrics::{accuracy, roc_auc};
use eegtl_core::types::Trial;

use crate::alignment::OnlineAligner;
use crate::model::{Classifier, NormMode};
use crate::stream::TrialBuffer;

use super::adapter::EntropyAdapter;
use super::error::{TentError, TentResult};
use super::trigger::{AdaptationTrigger, Decision, TriggerState};

/// Which path produced a prediction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PredictionPath {
    /// Unmodified model on the single trial
    Cold,
    /// Last row of an adapted window
    Adapted,
}

/// Output for one trial
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Sample index
    pub index: usize,
    /// Class probabilities
    pub probabilities: Vec<f64>,
    /// Most probable class
    pub class: usize,
    /// Producing path
    pub path: PredictionPath,
}

/// Everything a finished session produced
#[derive(Clone, Debug, Default)]
pub struct SessionOutcome {
    /// One prediction per consumed trial, in order
    pub predictions: Vec<Prediction>,
    /// Labels of the consumed trials, in order
    pub labels: Vec<Option<usize>>,
    /// Adaptation passes run
    pub adaptation_passes: usize,
}

impl SessionOutcome {
    /// Number of trials consumed
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    /// True when no trial was consumed
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Predictions made by the cold path
    pub fn cold_count(&self) -> usize {
        self.predictions.iter().filter(|p| p.path == PredictionPath::Cold).count()
    }

    /// Predictions made by the adapted path
    pub fn adapted_count(&self) -> usize {
        self.predictions.iter().filter(|p| p.path == PredictionPath::Adapted).count()
    }

    /// All labels, failing on the first unlabeled trial
    pub fn true_labels(&self) -> TentResult<Vec<usize>> {
        self.labels
            .iter()
            .enumerate()
            .map(|(index, label)| label.ok_or(TentError::UnlabeledTrial { index }))
            .collect()
    }

    /// Predicted classes
    pub fn predicted_classes(&self) -> Vec<usize> {
        self.predictions.iter().map(|p| p.class).collect()
    }

    /// Summary score under an evaluation policy.
    ///
    /// Balanced: accuracy of the hard predictions. Imbalanced: ROC AUC of the
    /// class-1 probability (binary only). Returned as a fraction.
    pub fn score(&self, policy: EvaluationPolicy, class_num: usize) -> TentResult<f64> {
        let labels = self.true_labels()?;
        let score = match policy {
            EvaluationPolicy::Balanced => accuracy(&labels, &self.predicted_classes())?,
            EvaluationPolicy::Imbalanced => {
                policy.check_classes(class_num)?;
                roc_auc(&labels, &self.positive_scores())?
            }
        };
        Ok(score)
    }

    /// Class-1 probability per trial (0 when a prediction has one class)
    pub fn positive_scores(&self) -> Vec<f64> {
        self.predictions
            .iter()
            .map(|p| p.probabilities.get(1).copied().unwrap_or(0.0))
            .collect()
    }

    /// Values written to prediction files: the class-1 probability for
    /// binary data, otherwise every probability flattened trial by trial
    pub fn export_scores(&self, class_num: usize) -> Vec<f64> {
        if class_num == 2 {
            self.positive_scores()
        } else {
            self.predictions.iter().flat_map(|p| p.probabilities.iter().copied()).collect()
        }
    }
}

/// Streaming session owning a model for its whole lifetime
pub struct TentSession<'m> {
    model: &'m mut dyn Classifier,
    config: TentConfig,
    adapt: bool,
    aligner: OnlineAligner,
    buffer: TrialBuffer,
    trigger: AdaptationTrigger,
    adapter: Option<EntropyAdapter>,
    shape: Option<(usize, usize)>,
    predictions: Vec<Prediction>,
    labels: Vec<Option<usize>>,
}

impl<'m> TentSession<'m> {
    /// Adapting session.
    ///
    /// Validates the configuration and the evaluation policy against the
    /// model's class count, and puts the model in inference mode.
    pub fn new(model: &'m mut dyn Classifier, config: &TentConfig) -> TentResult<Self> {
        config.validate()?;
        config.policy.check_classes(model.class_num())?;
        model.set_norm_mode(NormMode::Running);
        Ok(Self {
            model,
            config: config.clone(),
            adapt: true,
            aligner: OnlineAligner::new(config.covariance),
            buffer: TrialBuffer::new(),
            trigger: AdaptationTrigger::new(config.test_batch, config.stride),
            adapter: None,
            shape: None,
            predictions: Vec::new(),
            labels: Vec::new(),
        })
    }

    /// Session with adaptation disabled: every trial takes the cold path
    pub fn baseline(model: &'m mut dyn Classifier, config: &TentConfig) -> TentResult<Self> {
        let mut session = Self::new(model, config)?;
        session.adapt = false;
        Ok(session)
    }

    /// Trigger state
    pub fn state(&self) -> TriggerState {
        self.trigger.state()
    }

    /// Running alignment
    pub fn aligner(&self) -> &OnlineAligner {
        &self.aligner
    }

    /// The model being driven
    pub fn model(&self) -> &dyn Classifier {
        &*self.model
    }

    fn prepare(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        if self.config.align {
            self.aligner.align(x)
        } else {
            x.clone()
        }
    }

    /// Consume one trial
    pub fn step(&mut self, trial: Trial) -> TentResult<&Prediction> {
        let index = self.buffer.len();
        let actual = trial.data.shape();
        match self.shape {
            Some(expected) if expected != actual => {
                return Err(TentError::TrialShape { index, expected, actual });
            }
            _ => self.shape = Some(actual),
        }

        let decision = if self.adapt { self.trigger.observe(index)? } else { Decision::Cold };

        if self.config.align {
            let start = self.config.calc_time.then(Instant::now);
            self.aligner.update(&trial.data)?;
            if let Some(start) = start {
                debug!(index, elapsed_us = start.elapsed().as_micros() as u64, "alignment update");
            }
        }

        let label = trial.label;
        self.buffer.push(trial);

        let (probabilities, path) = match decision {
            Decision::Cold => {
                let raw = self
                    .buffer
                    .get(index)
                    .ok_or(TentError::WindowUnavailable { end: index, width: 1 })?;
                let x = self.prepare(&raw.data);
                let out = self.model.forward(std::slice::from_ref(&x))?;
                let probs = softmax_rows(&out.logits);
                (probs.row(0).iter().copied().collect::<Vec<f64>>(), PredictionPath::Cold)
            }
            Decision::Activate | Decision::Adapt => {
                let width = self.trigger.test_batch();
                let window = self
                    .buffer
                    .window(index, width)
                    .ok_or(TentError::WindowUnavailable { end: index, width })?;
                let batch: Vec<DMatrix<f64>> = window.iter().map(|t| self.prepare(&t.data)).collect();

                if decision == Decision::Activate {
                    info!(index, test_batch = width, "first full window");
                }
                let mut adapter = match self.adapter.take() {
                    Some(adapter) => adapter,
                    None => EntropyAdapter::activate(&mut *self.model, &self.config)?,
                };
                let adapted = adapter.adapt(&mut *self.model, &batch);
                self.adapter = Some(adapter);
                let adapted = adapted?;

                let last = adapted.probabilities.nrows() - 1;
                (adapted.probabilities.row(last).iter().copied().collect(), PredictionPath::Adapted)
            }
        };

        let class = argmax(&probabilities);
        self.labels.push(label);
        self.predictions.push(Prediction { index, probabilities, class, path });
        Ok(&self.predictions[self.predictions.len() - 1])
    }

    /// Consume a whole stream, then finish
    pub fn run<I>(mut self, stream: I) -> TentResult<SessionOutcome>
    where
        I: IntoIterator<Item = Trial>,
    {
        for trial in stream {
            self.step(trial)?;
        }
        Ok(self.finish())
    }

    /// Stop and hand back the recorded outputs
    pub fn finish(self) -> SessionOutcome {
        SessionOutcome {
            adaptation_passes: self.adapter.as_ref().map_or(0, EntropyAdapter::passes),
            predictions: self.predictions,
            labels: self.labels,
        }
    }
}
