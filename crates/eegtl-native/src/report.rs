//! Result persistence
//!
//! - `<log>/<method>.csv`: one row per finished experiment,
//!   `dataset, avg, std, s0 .. s13`
//! - `<log>/<dataset>_<method>_seed_<seed>_pred.csv`: one row of exported
//!   prediction scores per target subject
//!
//! Summary scores are percentages; prediction rows keep probabilities.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use eegtl_core::metrics::mean_std;

/// Per-subject columns in the summary file
pub const SUBJECT_COLUMNS: usize = 14;

/// Decimal places kept in summaries
pub const DECIMALS: i32 = 5;

/// Errors while writing reports
#[derive(Error, Debug)]
pub enum ReportError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// No seeds to summarize
    #[error("No scores to summarize")]
    Empty,

    /// Seeds scored different numbers of subjects
    #[error("Seed {seed} has {got} subject scores, expected {expected}")]
    Ragged {
        /// Offending seed position
        seed: usize,
        /// Scores found
        got: usize,
        /// Scores expected
        expected: usize,
    },
}

/// Result type for report writing
pub type ReportResult<T> = Result<T, ReportError>;

/// Aggregate over seeds
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    /// Dataset name
    pub dataset: String,
    /// Mean over seeds per subject
    pub subject_mean: Vec<f64>,
    /// Mean over seeds and subjects
    pub total_mean: f64,
    /// Population std of the per-seed means
    pub total_std: f64,
}

/// Convert a metric fraction to the percentage written to result files
#[must_use]
pub fn percent(fraction: f64) -> f64 {
    fraction * 100.0
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(DECIMALS);
    (value * scale).round() / scale
}

/// Aggregate `per_seed[seed][subject]` scores
pub fn summarize(dataset: &str, per_seed: &[Vec<f64>]) -> ReportResult<Summary> {
    let first = per_seed.first().ok_or(ReportError::Empty)?;
    let subjects = first.len();
    if subjects == 0 {
        return Err(ReportError::Empty);
    }
    for (seed, scores) in per_seed.iter().enumerate() {
        if scores.len() != subjects {
            return Err(ReportError::Ragged { seed, got: scores.len(), expected: subjects });
        }
    }

    let seeds = per_seed.len() as f64;
    let subject_mean: Vec<f64> = (0..subjects)
        .map(|s| per_seed.iter().map(|scores| scores[s]).sum::<f64>() / seeds)
        .collect();
    let seed_means: Vec<f64> = per_seed
        .iter()
        .map(|scores| scores.iter().sum::<f64>() / subjects as f64)
        .collect();
    let (total_mean, total_std) = mean_std(&seed_means);

    Ok(Summary {
        dataset: dataset.to_string(),
        subject_mean: subject_mean.into_iter().map(round).collect(),
        total_mean: round(total_mean),
        total_std: round(total_std),
    })
}

fn append_rows(path: &Path, header: Option<Vec<String>>, rows: &[Vec<String>]) -> ReportResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let fresh = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).flexible(true).from_writer(file);
    if fresh {
        if let Some(header) = header {
            writer.write_record(&header)?;
        }
    }
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Append a summary row to `<log_dir>/<method>.csv`, writing the header
/// when the file is new
pub fn append_summary(log_dir: &Path, method: &str, summary: &Summary) -> ReportResult<PathBuf> {
    let path = log_dir.join(format!("{method}.csv"));
    let mut header = vec!["dataset".to_string(), "avg".to_string(), "std".to_string()];
    header.extend((0..SUBJECT_COLUMNS).map(|s| format!("s{s}")));

    let mut row = vec![summary.dataset.clone(), summary.total_mean.to_string(), summary.total_std.to_string()];
    row.extend(
        (0..SUBJECT_COLUMNS).map(|s| summary.subject_mean.get(s).map(ToString::to_string).unwrap_or_default()),
    );

    append_rows(&path, Some(header), &[row])?;
    info!("Appended summary to {}", path.display());
    Ok(path)
}

/// Append one row of prediction scores for a target subject
pub fn append_predictions(
    log_dir: &Path,
    dataset: &str,
    method: &str,
    seed: u64,
    scores: &[f64],
) -> ReportResult<PathBuf> {
    let path = log_dir.join(format!("{dataset}_{method}_seed_{seed}_pred.csv"));
    let row: Vec<String> = scores.iter().map(ToString::to_string).collect();
    append_rows(&path, None, &[row])?;
    Ok(path)
}
