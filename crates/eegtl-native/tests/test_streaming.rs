//! Integration tests for the online Tent driver.
//!
//! Streams are synthetic and seeded, so every run sees the same trials.

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use eegtl_core::config::{CovarianceEstimator, TentConfig};
use eegtl_core::types::Trial;
use eegtl_native::alignment::mean_covariance;
use eegtl_native::model::{Classifier, LogVarNet, StateDict};
use eegtl_native::tent::{PredictionPath, TentError, TentSession, TriggerState};

const CHANNELS: usize = 6;
const SAMPLES: usize = 128;

fn synthetic_stream(n: usize, seed: u64) -> Vec<Trial> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|k| {
            let label = k % 2;
            let data = DMatrix::from_fn(CHANNELS, SAMPLES, |c, _| {
                let gain = if c == label { 2.5 } else { 1.0 };
                gain * rng.gen_range(-1.0..1.0)
            });
            Trial::new(data, label)
        })
        .collect()
}

fn tensor(state: &StateDict, name: &str) -> Vec<f64> {
    state.get(name).map(|t| t.values.clone()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Path accounting
// ---------------------------------------------------------------------------

/// 20 trials with a window of 8: 7 cold predictions, then 13 adapted ones.
#[test]
fn twenty_trials_window_eight() {
    let mut model = LogVarNet::new(CHANNELS, 2, 1);
    let config = TentConfig { test_batch: 8, ..TentConfig::default() };
    let outcome = TentSession::new(&mut model, &config).unwrap().run(synthetic_stream(20, 1)).unwrap();

    assert_eq!(outcome.len(), 20);
    assert_eq!(outcome.cold_count(), 7);
    assert_eq!(outcome.adapted_count(), 13);
    assert_eq!(outcome.adaptation_passes, 13);
    for (i, p) in outcome.predictions.iter().enumerate() {
        assert_eq!(p.index, i);
        let expected = if i < 7 { PredictionPath::Cold } else { PredictionPath::Adapted };
        assert_eq!(p.path, expected);
        assert_relative_eq!(p.probabilities.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
}

/// Output length always equals the number of trials consumed.
#[test]
fn output_length_matches_input() {
    for n in [0, 1, 7, 8, 9, 25] {
        let mut model = LogVarNet::new(CHANNELS, 2, 2);
        let config = TentConfig { test_batch: 8, ..TentConfig::default() };
        let outcome = TentSession::new(&mut model, &config).unwrap().run(synthetic_stream(n, 2)).unwrap();
        assert_eq!(outcome.len(), n);
        assert_eq!(outcome.labels.len(), n);
    }
}

// ---------------------------------------------------------------------------
// Parameter evolution
// ---------------------------------------------------------------------------

/// Before the first full window nothing in the model changes; afterwards
/// every trial moves the adaptable subset and nothing else.
#[test]
fn parameters_change_only_when_and_where_expected() {
    let mut model = LogVarNet::new(CHANNELS, 2, 3);
    let adaptable = model.adaptable_parameters();
    let initial = model.parameters().state_dict();
    let config = TentConfig { test_batch: 8, ..TentConfig::default() };
    let mut session = TentSession::new(&mut model, &config).unwrap();

    let mut previous = initial.clone();
    for (i, trial) in synthetic_stream(20, 3).into_iter().enumerate() {
        session.step(trial).unwrap();
        let current = session.model().parameters().state_dict();

        if i < 7 {
            assert_eq!(current, initial, "model changed on cold trial {i}");
            assert_eq!(session.state(), TriggerState::Cold);
        } else {
            assert_eq!(session.state(), TriggerState::Adapting);
            let moved = adaptable.iter().any(|name| tensor(&current, name) != tensor(&previous, name));
            assert!(moved, "no adaptable parameter changed on trial {i}");
        }

        for name in current.keys().filter(|name| !adaptable.contains(*name)) {
            assert_eq!(tensor(&current, name), tensor(&initial, name), "{name} changed on trial {i}");
        }
        previous = current;
    }
}

// ---------------------------------------------------------------------------
// Failure modes
// ---------------------------------------------------------------------------

/// A stride other than 1 aborts at the first full window with no results.
#[test]
fn stride_two_aborts_before_adapting() {
    let mut model = LogVarNet::new(CHANNELS, 2, 4);
    let config = TentConfig { test_batch: 8, stride: 2, ..TentConfig::default() };
    let err = TentSession::new(&mut model, &config).unwrap().run(synthetic_stream(20, 4)).unwrap_err();
    assert!(matches!(err, TentError::UnsupportedStride { stride: 2, index: 7 }));
}

/// The same stride is harmless on a stream shorter than one window.
#[test]
fn stride_two_on_short_stream_completes() {
    let mut model = LogVarNet::new(CHANNELS, 2, 4);
    let config = TentConfig { test_batch: 8, stride: 2, ..TentConfig::default() };
    let outcome = TentSession::new(&mut model, &config).unwrap().run(synthetic_stream(5, 4)).unwrap();
    assert_eq!(outcome.cold_count(), 5);
}

// ---------------------------------------------------------------------------
// Alignment inside the session
// ---------------------------------------------------------------------------

/// The running reference equals the mean covariance of the prefix seen so far.
#[test]
fn incremental_reference_matches_batch_mean() {
    let stream = synthetic_stream(12, 5);
    let mut model = LogVarNet::new(CHANNELS, 2, 5);
    let config = TentConfig { test_batch: 4, covariance: CovarianceEstimator::Sample, ..TentConfig::default() };
    let mut session = TentSession::new(&mut model, &config).unwrap();

    for (i, trial) in stream.iter().cloned().enumerate() {
        session.step(trial).unwrap();
        let batch = mean_covariance(&stream[..=i], CovarianceEstimator::Sample).unwrap();
        assert_relative_eq!(session.aligner().reference().unwrap(), &batch, epsilon = 1e-10);
    }
}

/// An all-zero trial at the start of the stream still yields finite outputs.
#[test]
fn zero_trial_keeps_outputs_finite() {
    let mut stream = synthetic_stream(10, 6);
    stream.insert(0, Trial::new(DMatrix::zeros(CHANNELS, SAMPLES), 0));

    let mut model = LogVarNet::new(CHANNELS, 2, 6);
    let config = TentConfig { test_batch: 4, ..TentConfig::default() };
    let outcome = TentSession::new(&mut model, &config).unwrap().run(stream).unwrap();

    assert_eq!(outcome.len(), 11);
    for p in &outcome.predictions {
        assert!(p.probabilities.iter().all(|v| v.is_finite()), "non-finite output at {}", p.index);
    }
}
