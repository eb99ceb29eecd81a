//! EEG Transfer Application
//!
//! Command-line entry point for streaming test-time adaptation experiments.
//!
//! # Usage
//!
//! ```bash
//! # Fit source checkpoints for every held-out subject and seed
//! eegtl calibrate --dataset BNCI2014001 --data-path ./data --runs-path ./runs
//!
//! # Stream every target subject with Tent
//! eegtl tent --dataset BNCI2014001 --test-batch 8 --lr 0.001
//!
//! # Imbalanced (2:1) binary target, settings from a file
//! eegtl tent --config experiment.json --imbalanced
//!
//! # Train a DAN model per held-out subject
//! eegtl dan --dataset BNCI2014001 --epochs 100 --alignment-weight 1.0
//!
//! # Print dataset constants
//! eegtl datasets
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use eegtl_core::config::{CovarianceEstimator, EvaluationPolicy, ExperimentConfig};
use eegtl_core::types::DatasetId;
use eegtl_native::ExperimentRunner;

/// EEG Transfer Application
#[derive(Parser, Debug)]
#[command(name = "eegtl")]
#[command(author, version, about = "Cross-subject EEG decoding with streaming test-time adaptation", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run Tent on every seed and held-out subject
    Tent(ExperimentArgs),

    /// Fit source checkpoints (normalization statistics and discriminant head)
    Calibrate(ExperimentArgs),

    /// Train with an MK-MMD alignment term on every held-out subject
    Dan(DanArgs),

    /// List supported datasets
    Datasets,
}

/// Experiment settings; flags override values from `--config`
#[derive(Args, Debug, Clone, Default)]
struct ExperimentArgs {
    /// JSON experiment configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset name (BNCI2014001, BNCI2014002, BNCI2015001, BNCI2014001-4)
    #[arg(short, long)]
    dataset: Option<String>,

    /// Directory holding `<dataset>/X.npy`, `labels.npy` and `meta.csv`
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Directory holding checkpoints
    #[arg(long)]
    runs_path: Option<PathBuf>,

    /// Directory receiving result CSV files
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Method name used for result files
    #[arg(long)]
    method: Option<String>,

    /// Comma-separated seeds
    #[arg(long, value_delimiter = ',')]
    seeds: Option<Vec<u64>>,

    /// Sliding-window width
    #[arg(long)]
    test_batch: Option<usize>,

    /// Gradient steps per adaptation pass
    #[arg(long)]
    steps: Option<usize>,

    /// Window stride (only 1 is supported once adaptation starts)
    #[arg(long)]
    stride: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Disable Euclidean alignment
    #[arg(long)]
    no_align: bool,

    /// Evaluate on a 2:1 imbalanced target with ROC AUC
    #[arg(long)]
    imbalanced: bool,

    /// Divide covariances by T instead of T - 1
    #[arg(long)]
    population_cov: bool,

    /// Log per-trial alignment time at debug level
    #[arg(long)]
    calc_time: bool,

    /// Skip the offline alignment score
    #[arg(long)]
    no_offline_eval: bool,
}

/// DAN settings on top of the shared experiment flags
#[derive(Args, Debug, Clone, Default)]
struct DanArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,

    /// Passes over the source trials
    #[arg(long)]
    epochs: Option<usize>,

    /// Weight of the MK-MMD term
    #[arg(long)]
    alignment_weight: Option<f64>,

    /// Use the quadratic MMD estimator
    #[arg(long)]
    quadratic: bool,
}

impl DanArgs {
    fn resolve(&self) -> anyhow::Result<ExperimentConfig> {
        let mut config = self.experiment.resolve()?;
        if let Some(epochs) = self.epochs {
            config.dan.epochs = epochs;
        }
        if let Some(weight) = self.alignment_weight {
            config.dan.alignment_weight = weight;
        }
        if let Some(lr) = self.experiment.lr {
            config.dan.lr = lr;
        }
        if self.quadratic {
            config.dan.linear = false;
        }
        Ok(config)
    }
}

impl ExperimentArgs {
    fn resolve(&self) -> anyhow::Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading configuration {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing configuration {}", path.display()))?
            }
            None => ExperimentConfig::default(),
        };

        if let Some(name) = &self.dataset {
            config.dataset = name.parse::<DatasetId>()?;
        }
        if let Some(path) = &self.data_path {
            config.data_path.clone_from(path);
        }
        if let Some(path) = &self.runs_path {
            config.runs_path.clone_from(path);
        }
        if let Some(path) = &self.log_path {
            config.log_path.clone_from(path);
        }
        if let Some(method) = &self.method {
            config.method.clone_from(method);
        }
        if let Some(seeds) = &self.seeds {
            config.seeds.clone_from(seeds);
        }
        if let Some(test_batch) = self.test_batch {
            config.tent.test_batch = test_batch;
        }
        if let Some(steps) = self.steps {
            config.tent.steps = steps;
        }
        if let Some(stride) = self.stride {
            config.tent.stride = stride;
        }
        if let Some(lr) = self.lr {
            config.tent.lr = lr;
        }
        if self.no_align {
            config.tent.align = false;
        }
        if self.imbalanced {
            config.tent.policy = EvaluationPolicy::Imbalanced;
        }
        if self.population_cov {
            config.tent.covariance = CovarianceEstimator::Population;
        }
        if self.calc_time {
            config.tent.calc_time = true;
        }
        if self.no_offline_eval {
            config.offline_eval = false;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("EEG Transfer v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Tent(args) => run_tent(&args)?,
        Commands::Calibrate(args) => run_calibrate(&args)?,
        Commands::Dan(args) => run_dan(&args)?,
        Commands::Datasets => list_datasets(),
    }

    Ok(())
}

/// Run the streaming experiment and print the aggregate
fn run_tent(args: &ExperimentArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    info!("Configuration: {}", serde_json::to_string(&config)?);
    let runner = ExperimentRunner::new(config).context("invalid experiment configuration")?;
    let report = runner.run().context("experiment aborted")?;

    let metric = runner.config().tent.policy.metric_name();
    println!("{} {} on {}", runner.config().method, metric, report.summary.dataset);
    println!("  subject mean: {:?}", report.summary.subject_mean);
    println!("  total:        {:.5} ± {:.5}", report.summary.total_mean, report.summary.total_std);
    println!("  no adaptation: {:.5} ± {:.5}", report.baseline.total_mean, report.baseline.total_std);
    println!("  written to {}", report.summary_path.display());
    Ok(())
}

/// Fit and save source checkpoints
fn run_calibrate(args: &ExperimentArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    let runner = ExperimentRunner::new(config).context("invalid experiment configuration")?;
    let written = runner.calibrate().context("calibration aborted")?;
    println!("Wrote {} checkpoints under {}", written.len(), runner.config().runs_path.display());
    Ok(())
}

/// Train DAN on every fold and print the aggregate
fn run_dan(args: &DanArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    info!("Configuration: {}", serde_json::to_string(&config)?);
    let runner = ExperimentRunner::new(config).context("invalid experiment configuration")?;
    let report = runner.dan().context("DAN training aborted")?;

    let metric = runner.config().tent.policy.metric_name();
    println!("DAN {} on {}", metric, report.summary.dataset);
    println!("  subject mean: {:?}", report.summary.subject_mean);
    println!("  total:        {:.5} ± {:.5}", report.summary.total_mean, report.summary.total_std);
    println!("  written to {}", report.summary_path.display());
    Ok(())
}

/// Print dataset constants
fn list_datasets() {
    println!(
        "{:<15} {:>8} {:>8} {:>7} {:>8} {:>6} {:>8} {:>7}",
        "dataset", "subjects", "channels", "classes", "samples", "rate", "seconds", "trials"
    );
    for dataset in DatasetId::ALL {
        let spec = dataset.spec();
        println!(
            "{:<15} {:>8} {:>8} {:>7} {:>8} {:>6} {:>8.3} {:>7}",
            dataset.name(),
            spec.subjects,
            spec.channels,
            spec.class_num,
            spec.time_samples,
            spec.sample_rate_hz,
            spec.trial_duration_s(),
            spec.trials_per_subject
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "eegtl",
            "tent",
            "--dataset",
            "bnci2014002",
            "--seeds",
            "1,2",
            "--test-batch",
            "16",
            "--no-align",
            "--imbalanced",
        ]);
        let Commands::Tent(args) = cli.command else {
            panic!("expected tent command");
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.dataset, DatasetId::Bnci2014002);
        assert_eq!(config.seeds, vec![1, 2]);
        assert_eq!(config.tent.test_batch, 16);
        assert!(!config.tent.align);
        assert_eq!(config.tent.policy, EvaluationPolicy::Imbalanced);
        assert_eq!(config.tent.steps, 1);
    }

    #[test]
    fn test_dan_flags() {
        let cli = Cli::parse_from([
            "eegtl",
            "dan",
            "--dataset",
            "BNCI2014001",
            "--epochs",
            "5",
            "--alignment-weight",
            "0.5",
            "--lr",
            "0.01",
            "--quadratic",
        ]);
        let Commands::Dan(args) = cli.command else {
            panic!("expected dan command");
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.dataset, DatasetId::Bnci2014001);
        assert_eq!(config.dan.epochs, 5);
        assert_eq!(config.dan.alignment_weight, 0.5);
        assert_eq!(config.dan.lr, 0.01);
        assert!(!config.dan.linear);
        assert_eq!(config.dan.batch_size, 32);
    }

    #[test]
    fn test_unknown_dataset_rejected() {
        let args = ExperimentArgs { dataset: Some("nope".to_string()), ..ExperimentArgs::default() };
        assert!(args.resolve().is_err());
    }
}
