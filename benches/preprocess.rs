use criterion::Criterion;

use tofsignal::filter::filtfilt;
use tofsignal::preprocess::{PreprocessConfig, Preprocessor};
use tofsignal::{PeakPicker, Trace};

fn raw_trace(n: usize) -> Trace<'static> {
    let (x, y): (Vec<f64>, Vec<f64>) = (0..n)
        .map(|i| {
            let t = 25e-6 + i as f64 * 0.5e-9;
            let t_us = t * 1e6;
            let peak = 50.0 * (-0.5 * ((t_us - 30.0) / 0.003).powi(2)).exp();
            let signal = 5.0 + 0.5 * (t_us - 25.0) + peak;
            (t, -signal / 1000.0)
        })
        .unzip();
    Trace::from_vecs(x, y).unwrap()
}

fn preprocessing(c: &mut Criterion) {
    let trace = raw_trace(20000);
    let config = PreprocessConfig::default()
        .window_length(16000)
        .allow_truncated_window(true);
    let preprocessor = Preprocessor::new(config);
    c.bench_function("filtfilt", |b| {
        b.iter(|| filtfilt(&trace.y, 1000.0, 10000.0, 5).unwrap())
    });
    c.bench_function("preprocess", |b| {
        b.iter(|| preprocessor.process(&trace).unwrap())
    });
}

fn peak_picking(c: &mut Criterion) {
    let x: Vec<f64> = (0..30000).map(|i| 50.0 + i as f64 * 0.002).collect();
    let y: Vec<f64> = x
        .iter()
        .map(|x| {
            (0..10)
                .map(|k| {
                    let mu = 60.0 + 4.0 * k as f64;
                    40.0 * (-0.5 * ((x - mu) / 0.01).powi(2)).exp()
                })
                .sum()
        })
        .collect();
    let picker = PeakPicker::default();
    c.bench_function("pick_peaks", |b| b.iter(|| picker.pick(&x, &y).unwrap()));
}

fn benchmarks(c: &mut Criterion) {
    preprocessing(c);
    peak_picking(c);
}

criterion::criterion_group!(benches, benchmarks);
criterion::criterion_main!(benches);
