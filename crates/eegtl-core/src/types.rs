//! Core types for EEG transfer experiments
//!
//! This module provides the fundamental data types shared by every crate:
//! - Dataset identifiers and their recording constants
//! - Motor-imagery trials (channels × samples)
//! - Subject identifiers and leave-one-subject-out naming

use core::fmt;
use core::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ============================================================================
// Datasets
// ============================================================================

/// Experimental paradigm of a dataset
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Paradigm {
    /// Motor imagery
    MotorImagery,
    /// Event-related potential
    Erp,
}

/// Public BCI datasets supported by the experiment runner.
///
/// `Bnci2014001FourClass` is the four-class variant of BNCI2014001; the plain
/// variant keeps only the left/right hand classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetId {
    /// BNCI2014001, left vs right hand
    #[serde(rename = "BNCI2014001")]
    Bnci2014001,
    /// BNCI2014002, right hand vs feet
    #[serde(rename = "BNCI2014002")]
    Bnci2014002,
    /// BNCI2015001, right hand vs feet
    #[serde(rename = "BNCI2015001")]
    Bnci2015001,
    /// BNCI2014001, all four classes
    #[serde(rename = "BNCI2014001-4")]
    Bnci2014001FourClass,
}

impl DatasetId {
    /// All datasets in display order
    pub const ALL: [Self; 4] = [
        Self::Bnci2014001,
        Self::Bnci2014002,
        Self::Bnci2015001,
        Self::Bnci2014001FourClass,
    ];

    /// Canonical dataset name, used in file paths
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bnci2014001 => "BNCI2014001",
            Self::Bnci2014002 => "BNCI2014002",
            Self::Bnci2015001 => "BNCI2015001",
            Self::Bnci2014001FourClass => "BNCI2014001-4",
        }
    }

    /// Name of the directory holding the exported arrays.
    ///
    /// Both BNCI2014001 variants share one export.
    #[must_use]
    pub const fn storage_name(self) -> &'static str {
        match self {
            Self::Bnci2014001 | Self::Bnci2014001FourClass => "BNCI2014001",
            other => other.name(),
        }
    }

    /// Recording constants for this dataset
    #[must_use]
    pub const fn spec(self) -> DatasetSpec {
        match self {
            Self::Bnci2014001 => DatasetSpec {
                paradigm: Paradigm::MotorImagery,
                subjects: 9,
                channels: 22,
                class_num: 2,
                time_samples: 1001,
                sample_rate_hz: 250,
                trials_per_subject: 144,
                feature_deep_dim: 248,
            },
            Self::Bnci2014002 => DatasetSpec {
                paradigm: Paradigm::MotorImagery,
                subjects: 14,
                channels: 15,
                class_num: 2,
                time_samples: 2561,
                sample_rate_hz: 512,
                trials_per_subject: 100,
                feature_deep_dim: 640,
            },
            Self::Bnci2015001 => DatasetSpec {
                paradigm: Paradigm::MotorImagery,
                subjects: 12,
                channels: 13,
                class_num: 2,
                time_samples: 2561,
                sample_rate_hz: 512,
                trials_per_subject: 200,
                feature_deep_dim: 640,
            },
            Self::Bnci2014001FourClass => DatasetSpec {
                paradigm: Paradigm::MotorImagery,
                subjects: 9,
                channels: 22,
                class_num: 4,
                time_samples: 1001,
                sample_rate_hz: 250,
                trials_per_subject: 288,
                feature_deep_dim: 248,
            },
        }
    }

    /// Electrode labels in export order
    #[must_use]
    pub const fn channel_names(self) -> &'static [&'static str] {
        match self {
            Self::Bnci2014001 | Self::Bnci2014001FourClass => &[
                "Fz", "FC3", "FC1", "FCz", "FC2", "FC4", "C5", "C3", "C1", "Cz", "C2", "C4",
                "C6", "CP3", "CP1", "CPz", "CP2", "CP4", "P1", "Pz", "P2", "POz",
            ],
            Self::Bnci2014002 => &[
                "EEG1", "EEG2", "EEG3", "EEG4", "EEG5", "EEG6", "EEG7", "EEG8", "EEG9", "EEG10",
                "EEG11", "EEG12", "EEG13", "EEG14", "EEG15",
            ],
            Self::Bnci2015001 => &[
                "FC3", "FCz", "FC4", "C5", "C3", "C1", "Cz", "C2", "C4", "C6", "CP3", "CPz",
                "CP4",
            ],
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownDataset { name: s.to_string() })
    }
}

/// Recording constants of a dataset
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Experimental paradigm
    pub paradigm: Paradigm,
    /// Number of subjects
    pub subjects: usize,
    /// Number of EEG channels
    pub channels: usize,
    /// Number of classes
    pub class_num: usize,
    /// Samples per trial
    pub time_samples: usize,
    /// Sampling rate in Hz
    pub sample_rate_hz: u32,
    /// Trials per subject (first session)
    pub trials_per_subject: usize,
    /// Flattened feature size of the reference deep backbone
    pub feature_deep_dim: usize,
}

impl DatasetSpec {
    /// Trial duration in seconds
    #[must_use]
    pub fn trial_duration_s(&self) -> f64 {
        self.time_samples as f64 / f64::from(self.sample_rate_hz)
    }
}

// ============================================================================
// Subjects
// ============================================================================

/// Zero-based subject index within a dataset
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubjectId(pub usize);

impl SubjectId {
    /// Task label for a leave-one-subject-out fold, e.g. `Except_S3_2_S3`
    #[must_use]
    pub fn task_label(self) -> String {
        format!("Except_S{0}_2_S{0}", self.0)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

// ============================================================================
// Trials
// ============================================================================

/// One multichannel EEG trial.
///
/// `data` is `channels × time_samples`. The label is `None` when the trial
/// comes from an unlabeled stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Trial {
    /// Signal matrix, channels × samples
    pub data: DMatrix<f64>,
    /// Class index, if known
    pub label: Option<usize>,
}

impl Trial {
    /// Create a labeled trial
    #[must_use]
    pub fn new(data: DMatrix<f64>, label: usize) -> Self {
        Self { data, label: Some(label) }
    }

    /// Create a trial with no label
    #[must_use]
    pub fn unlabeled(data: DMatrix<f64>) -> Self {
        Self { data, label: None }
    }

    /// Number of channels
    #[inline]
    #[must_use]
    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    /// Number of time samples
    #[inline]
    #[must_use]
    pub fn samples(&self) -> usize {
        self.data.ncols()
    }

    /// Same label, different signal
    #[must_use]
    pub fn with_data(&self, data: DMatrix<f64>) -> Self {
        Self { data, label: self.label }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_round_trip_names() {
        for id in DatasetId::ALL {
            let parsed: DatasetId = id.name().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert!("BNCI2099001".parse::<DatasetId>().is_err());
    }

    #[test]
    fn test_channel_names_match_spec() {
        for id in DatasetId::ALL {
            assert_eq!(id.channel_names().len(), id.spec().channels);
        }
    }

    #[test]
    fn test_four_class_shares_storage() {
        assert_eq!(DatasetId::Bnci2014001FourClass.storage_name(), "BNCI2014001");
        assert_eq!(DatasetId::Bnci2014001FourClass.spec().class_num, 4);
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let json = serde_json::to_string(&DatasetId::Bnci2014001FourClass).unwrap();
        assert_eq!(json, "\"BNCI2014001-4\"");
    }

    #[test]
    fn test_task_label() {
        assert_eq!(SubjectId(3).task_label(), "Except_S3_2_S3");
        assert_eq!(SubjectId(3).to_string(), "S3");
    }
}
