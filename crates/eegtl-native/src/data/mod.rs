//! Dataset loading and leave-one-subject-out folds
//!
//! Each dataset lives in `<data_path>/<dataset>/` as three files:
//!
//! ```text
//! X.npy       # signals  [trials, channels, samples]  f64 or f32
//! labels.npy  # classes  [trials]                     i64 or i32
//! meta.csv    # one row per trial with `subject` and `session` columns
//! ```
//!
//! Only the first session of each subject is kept, and only labels below the
//! dataset's class count. Subjects are numbered 0.. in ascending order of
//! their ids in `meta.csv`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use ndarray::{Array1, Array3, ArrayView3, Axis};
use ndarray_npy::ReadNpyExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use eegtl_core::config::CovarianceEstimator;
use eegtl_core::error::CoreError;
use eegtl_core::types::{DatasetId, SubjectId, Trial};

use crate::alignment::euclidean_align;

pub mod batches;

pub use batches::CyclicBatches;

/// Signals file name
pub const SIGNALS_FILE: &str = "X.npy";
/// Labels file name
pub const LABELS_FILE: &str = "labels.npy";
/// Per-trial metadata file name
pub const META_FILE: &str = "meta.csv";

// ============================================================================
// Error Types
// ============================================================================

/// Errors while reading datasets or building folds
#[derive(Error, Debug)]
pub enum DataError {
    /// Dataset directory missing
    #[error("Dataset directory not found: {}", path.display())]
    DirectoryNotFound {
        /// Expected location
        path: PathBuf,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unreadable `.npy` file
    #[error("NPY read error at {}: {reason}", path.display())]
    Npy {
        /// File that failed
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// Unreadable metadata
    #[error("Metadata error: {0}")]
    Csv(#[from] csv::Error),

    /// Files disagree on the number of trials
    #[error("Trial count mismatch: {signals} signals, {labels} labels, {meta} metadata rows")]
    CountMismatch {
        /// Trials in `X.npy`
        signals: usize,
        /// Entries in `labels.npy`
        labels: usize,
        /// Rows in `meta.csv`
        meta: usize,
    },

    /// Negative class index
    #[error("Trial {index} has negative label {value}")]
    NegativeLabel {
        /// Trial position in the file
        index: usize,
        /// Label value
        value: i64,
    },

    /// Subject not present in the loaded data
    #[error("Subject {0} not found")]
    UnknownSubject(SubjectId),

    /// Nothing to iterate over
    #[error("Empty source")]
    EmptySource,

    /// Shape or alignment failure
    #[error("{0}")]
    Core(#[from] CoreError),
}

/// Result type for data operations
pub type DataResult<T> = Result<T, DataError>;

// ============================================================================
// Subjects and Folds
// ============================================================================

/// One row of `meta.csv`; other columns are ignored
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MetaRow {
    /// Subject id as recorded (1-based for MOABB exports)
    pub subject: usize,
    /// Session name
    pub session: String,
}

/// Trials of one subject in recording order
#[derive(Clone, Debug)]
pub struct SubjectData {
    /// 0-based subject index
    pub id: SubjectId,
    /// Labelled trials
    pub trials: Vec<Trial>,
}

/// A held-out subject and everyone else
#[derive(Clone, Debug)]
pub struct Fold {
    /// Held-out subject
    pub target_id: SubjectId,
    /// Source trials, aligned per subject when requested
    pub source: Vec<Trial>,
    /// Raw target trials in arrival order
    pub target: Vec<Trial>,
}

/// All subjects of one dataset
#[derive(Clone, Debug)]
pub struct SubjectTrials {
    dataset: DatasetId,
    subjects: Vec<SubjectData>,
}

impl SubjectTrials {
    /// Group raw arrays by subject.
    ///
    /// `signals` is `[trials, channels, samples]`. Every trial must have the
    /// dataset's channel count.
    pub fn from_arrays(
        dataset: DatasetId,
        signals: ArrayView3<'_, f64>,
        labels: &[i64],
        meta: &[MetaRow],
    ) -> DataResult<Self> {
        let spec = dataset.spec();
        let (count, channels, samples) = signals.dim();
        if count != labels.len() || count != meta.len() {
            return Err(DataError::CountMismatch { signals: count, labels: labels.len(), meta: meta.len() });
        }
        if channels != spec.channels {
            return Err(CoreError::ShapeMismatch {
                expected: (spec.channels, spec.time_samples),
                actual: (channels, samples),
            }
            .into());
        }
        if samples != spec.time_samples {
            warn!(dataset = %dataset, expected = spec.time_samples, got = samples, "unexpected trial length");
        }

        let mut first_session: BTreeMap<usize, &str> = BTreeMap::new();
        let mut grouped: BTreeMap<usize, Vec<Trial>> = BTreeMap::new();
        for (index, (row, &label)) in meta.iter().zip(labels).enumerate() {
            if label < 0 {
                return Err(DataError::NegativeLabel { index, value: label });
            }
            let session = *first_session.entry(row.subject).or_insert(row.session.as_str());
            let trials = grouped.entry(row.subject).or_default();
            let class = usize::try_from(label).unwrap_or(usize::MAX);
            if session != row.session || class >= spec.class_num {
                continue;
            }
            let view = signals.index_axis(Axis(0), index);
            let data = DMatrix::from_fn(channels, samples, |c, t| view[[c, t]]);
            trials.push(Trial::new(data, class));
        }

        let subjects: Vec<SubjectData> = grouped
            .into_values()
            .enumerate()
            .map(|(k, trials)| {
                if trials.len() != spec.trials_per_subject {
                    warn!(
                        subject = k,
                        expected = spec.trials_per_subject,
                        got = trials.len(),
                        "unexpected trial count"
                    );
                }
                SubjectData { id: SubjectId(k), trials }
            })
            .collect();

        if subjects.len() != spec.subjects {
            warn!(dataset = %dataset, expected = spec.subjects, got = subjects.len(), "unexpected subject count");
        }
        Ok(Self { dataset, subjects })
    }

    /// Dataset identifier
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    /// Subjects in index order
    pub fn subjects(&self) -> &[SubjectData] {
        &self.subjects
    }

    /// One subject
    pub fn subject(&self, id: SubjectId) -> DataResult<&SubjectData> {
        self.subjects.iter().find(|s| s.id == id).ok_or(DataError::UnknownSubject(id))
    }

    /// Leave-one-subject-out split with `target` held out.
    ///
    /// With `align`, each source subject is aligned with its own mean
    /// covariance. Target trials are returned raw.
    pub fn fold(&self, target: SubjectId, align: bool, estimator: CovarianceEstimator) -> DataResult<Fold> {
        let held_out = self.subject(target)?;
        let mut source = Vec::new();
        for subject in self.subjects.iter().filter(|s| s.id != target) {
            if subject.trials.is_empty() {
                continue;
            }
            if align {
                source.extend(euclidean_align(&subject.trials, estimator)?);
            } else {
                source.extend(subject.trials.iter().cloned());
            }
        }
        if source.is_empty() {
            return Err(DataError::EmptySource);
        }
        debug!(subject = %target, source = source.len(), target_trials = held_out.trials.len(), "built fold");
        Ok(Fold { target_id: target, source, target: held_out.trials.clone() })
    }
}

/// 2:1 target stream: every class-0 trial and the first half of the class-1
/// trials, arrival order kept
pub fn imbalance(trials: &[Trial]) -> Vec<Trial> {
    let positives = trials.iter().filter(|t| t.label == Some(1)).count();
    let keep = positives / 2;
    let mut kept = 0;
    trials
        .iter()
        .filter(|t| match t.label {
            Some(1) => {
                kept += 1;
                kept <= keep
            }
            _ => true,
        })
        .cloned()
        .collect()
}

// ============================================================================
// Loader
// ============================================================================

/// Reads one dataset directory
#[derive(Clone, Debug)]
pub struct DatasetLoader {
    root: PathBuf,
    dataset: DatasetId,
}

impl DatasetLoader {
    /// Loader for `<data_path>/<dataset storage name>/`
    pub fn new(data_path: &Path, dataset: DatasetId) -> Self {
        Self { root: data_path.join(dataset.storage_name()), dataset }
    }

    /// Read and group every trial
    pub fn load(&self) -> DataResult<SubjectTrials> {
        if !self.root.is_dir() {
            return Err(DataError::DirectoryNotFound { path: self.root.clone() });
        }
        let signals = read_signals(&self.root.join(SIGNALS_FILE))?;
        let labels = read_labels(&self.root.join(LABELS_FILE))?;
        let meta = read_meta(&self.root.join(META_FILE))?;
        info!(dataset = %self.dataset, trials = labels.len(), "Loaded {}", self.root.display());
        SubjectTrials::from_arrays(self.dataset, signals.view(), &labels, &meta)
    }
}

fn npy_error(path: &Path, err: impl std::fmt::Display) -> DataError {
    DataError::Npy { path: path.to_path_buf(), reason: err.to_string() }
}

fn read_signals(path: &Path) -> DataResult<Array3<f64>> {
    let open = || File::open(path).map(BufReader::new);
    if let Ok(array) = Array3::<f64>::read_npy(open()?) {
        return Ok(array);
    }
    let array = Array3::<f32>::read_npy(open()?).map_err(|e| npy_error(path, e))?;
    Ok(array.mapv(f64::from))
}

fn read_labels(path: &Path) -> DataResult<Vec<i64>> {
    let open = || File::open(path).map(BufReader::new);
    if let Ok(array) = Array1::<i64>::read_npy(open()?) {
        return Ok(array.to_vec());
    }
    let array = Array1::<i32>::read_npy(open()?).map_err(|e| npy_error(path, e))?;
    Ok(array.iter().map(|&v| i64::from(v)).collect())
}

fn read_meta(path: &Path) -> DataResult<Vec<MetaRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<MetaRow>, _>>()?;
    Ok(rows)
}
