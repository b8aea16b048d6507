use chrono::{DateTime, Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gpu_sonar::analyzer::{Classifier, Limits};
use gpu_sonar::monitor::nvidia_smi::parse_sample_line;
use gpu_sonar::sample::{DeviceId, Metric, PeakTracker, SampleBuffer, Snapshot};

const WINDOW: usize = 20;

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

fn throttling_window() -> Vec<Snapshot> {
    (0..WINDOW)
        .map(|i| {
            let t = i as f64;
            Snapshot::empty(base() + Duration::seconds(i as i64))
                .with(Metric::GpuUtil, 97.0)
                .with(Metric::MemUtil, 35.0)
                .with(Metric::Temperature, 78.0 + t * 0.4)
                .with(Metric::GpuClock, 1980.0 - t * 25.0)
                .with(Metric::GpuClockMax, 1980.0)
                .with(Metric::Power, 280.0)
                .with(Metric::PowerLimit, 350.0)
                .with(Metric::PcieUtil, 12.0)
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let classifier = Classifier::default();
    let window = throttling_window();
    let limits = Limits::new(83.0);

    c.bench_function("classifier/full_window", |b| {
        b.iter(|| classifier.classify(black_box(DeviceId(0)), black_box(&window), &limits))
    });
}

fn bench_commit(c: &mut Criterion) {
    let classifier = Classifier::default();
    let snapshots = throttling_window();

    c.bench_function("pipeline/push_observe_classify", |b| {
        b.iter(|| {
            let mut buffer = SampleBuffer::new(DeviceId(0), WINDOW / 2);
            let mut peaks = PeakTracker::with_thresholds([(Metric::Temperature, 83.0)]);
            let mut last = None;
            for snapshot in &snapshots {
                peaks.observe_snapshot(snapshot);
                if buffer.push(snapshot.clone()).is_ok() {
                    last = Some(classifier.classify_with_peaks(
                        DeviceId(0),
                        &buffer.window(),
                        &peaks.snapshot(),
                    ));
                }
            }
            black_box(last)
        })
    });
}

fn bench_parse(c: &mut Criterion) {
    let line = "97, 35, 30210, 40960, 81, 281.52, 350.00, 1755, 1980, 1593, 64";
    let now = base();

    c.bench_function("nvidia_smi/parse_sample_line", |b| {
        b.iter(|| parse_sample_line(black_box(line), now))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_classify(c);
    bench_commit(c);
    bench_parse(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
