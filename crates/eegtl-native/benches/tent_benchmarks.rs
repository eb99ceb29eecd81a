//! Benchmarks for alignment and adaptation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::DMatrix;

use eegtl_core::config::{CovarianceEstimator, TentConfig};
use eegtl_core::types::Trial;
use eegtl_native::alignment::OnlineAligner;
use eegtl_native::model::LogVarNet;
use eegtl_native::tent::TentSession;

/// Generate a synthetic multichannel trial (sinusoids with pseudo-noise)
fn generate_trial(channels: usize, samples: usize, offset: usize) -> DMatrix<f64> {
    use std::f64::consts::PI;

    DMatrix::from_fn(channels, samples, |c, t| {
        let time = (t + offset) as f64 / 250.0;
        let signal = (2.0 * PI * (8.0 + c as f64) * time).sin();
        let noise = ((t * (c + 3) + offset) as f64 * 0.123).sin() * 0.3;
        (signal + noise) * 20.0
    })
}

fn bench_online_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("online_alignment");

    for channels in [13, 15, 22].iter() {
        let trial = generate_trial(*channels, 1001, 0);

        group.bench_with_input(BenchmarkId::from_parameter(channels), channels, |b, _| {
            let mut aligner = OnlineAligner::new(CovarianceEstimator::Sample);
            b.iter(|| {
                aligner.update(black_box(&trial)).map(|r| r.nrows()).unwrap_or(0);
                black_box(aligner.align(&trial))
            });
        });
    }

    group.finish();
}

fn bench_tent_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("tent_stream");
    group.sample_size(10);

    for test_batch in [4, 8, 16].iter() {
        let stream: Vec<Trial> = (0..32).map(|k| Trial::new(generate_trial(22, 501, k * 7), k % 2)).collect();
        let config = TentConfig { test_batch: *test_batch, ..TentConfig::default() };

        group.bench_with_input(BenchmarkId::from_parameter(test_batch), test_batch, |b, _| {
            b.iter(|| {
                let mut model = LogVarNet::new(22, 2, 1);
                let session = TentSession::new(&mut model, &config).map(|s| s.run(stream.clone()));
                black_box(session.is_ok())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_online_alignment, bench_tent_stream);
criterion_main!(benches);
