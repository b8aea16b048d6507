use crate::analyzer::{Classifier, Label, Verdict};
use crate::config::Config;
use crate::sample::{DeviceId, Metric, PeakState, PeakTracker, SampleBuffer, Snapshot};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

/// One line of a JSON-lines recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSample {
    pub device: DeviceId,
    pub snapshot: Snapshot,
}

/// Offline classification result for one device
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub device: DeviceId,
    pub samples: usize,
    pub rejected: usize,
    /// How many cycles each label won
    pub label_counts: BTreeMap<Label, usize>,
    pub final_verdict: Verdict,
    pub peaks: PeakState,
}

impl ReplaySummary {
    /// Most frequent label, ties going to the higher-priority one
    pub fn dominant_label(&self) -> Label {
        self.label_counts
            .iter()
            .filter(|(label, _)| **label != Label::Unknown)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map_or(Label::Unknown, |(label, _)| *label)
    }
}

pub fn read_recording<R: BufRead>(reader: R) -> Result<Vec<RecordedSample>> {
    let mut samples = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: RecordedSample = serde_json::from_str(&line)
            .with_context(|| format!("parsing line {}", idx + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

pub fn write_sample<W: Write>(writer: &mut W, sample: &RecordedSample) -> Result<()> {
    serde_json::to_writer(&mut *writer, sample)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Run every device's recording through its own buffer, tracker and the
/// classifier, devices in parallel
pub fn replay(samples: Vec<RecordedSample>, config: &Config) -> Vec<ReplaySummary> {
    let mut by_device: BTreeMap<DeviceId, Vec<Snapshot>> = BTreeMap::new();
    for sample in samples {
        by_device.entry(sample.device).or_default().push(sample.snapshot);
    }

    let classifier = Classifier::new(config.thresholds.clone());
    by_device
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(device, snapshots)| replay_device(device, snapshots, config, &classifier))
        .collect()
}

fn replay_device(
    device: DeviceId,
    snapshots: Vec<Snapshot>,
    config: &Config,
    classifier: &Classifier,
) -> ReplaySummary {
    let mut buffer = SampleBuffer::new(device, config.window_size);
    let mut peaks = PeakTracker::with_thresholds([(
        Metric::Temperature,
        config.thresholds.default_temp_threshold_c,
    )]);
    let mut label_counts = BTreeMap::new();
    let mut rejected = 0;
    let mut final_verdict = Verdict::unknown(device, None, 0);

    let samples = snapshots.len();
    for snapshot in snapshots {
        let observed = snapshot.clone();
        if let Err(e) = buffer.push(snapshot) {
            tracing::debug!(device = %device, error = %e, "skipping recorded snapshot");
            rejected += 1;
            continue;
        }
        peaks.observe_snapshot(&observed);

        let verdict = classifier.classify_with_peaks(device, &buffer.window(), &peaks.snapshot());
        *label_counts.entry(verdict.label).or_insert(0) += 1;
        final_verdict = verdict;
    }

    ReplaySummary {
        device,
        samples,
        rejected,
        label_counts,
        final_verdict,
        peaks: peaks.snapshot(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MetricSource, Profile, SyntheticSource};
    use std::io::Cursor;

    fn record(source: &SyntheticSource, devices: u32, rounds: usize) -> Vec<RecordedSample> {
        let mut samples = Vec::new();
        for _ in 0..rounds {
            for id in 0..devices {
                let device = DeviceId(id);
                samples.push(RecordedSample {
                    device,
                    snapshot: source.sample(device).unwrap(),
                });
            }
        }
        samples
    }

    #[test]
    fn test_recording_round_trips_through_json_lines() {
        let source = SyntheticSource::new(3, &[Profile::Compute]);
        let samples = record(&source, 1, 3);

        let mut out = Vec::new();
        for sample in &samples {
            write_sample(&mut out, sample).unwrap();
        }
        out.extend_from_slice(b"\n");

        let back = read_recording(Cursor::new(out)).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn test_bad_line_reports_its_number() {
        let err = read_recording(Cursor::new("{\"device\": 0}\n")).unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
    }

    #[test]
    fn test_replay_classifies_each_device() {
        let source = SyntheticSource::new(5, &[Profile::Memory, Profile::Idle]);
        let mut samples = record(&source, 2, 12);
        // Duplicate of an earlier snapshot: out of order, must be skipped
        samples.push(samples[0].clone());

        let config = Config {
            window_size: 6,
            ..Default::default()
        };
        let summaries = replay(samples, &config);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].device, DeviceId(0));
        assert_eq!(summaries[0].rejected, 1);
        assert_eq!(summaries[0].final_verdict.label, Label::MemoryBound);
        assert_eq!(summaries[0].dominant_label(), Label::MemoryBound);
        assert_eq!(summaries[1].final_verdict.label, Label::Idle);
        assert_eq!(summaries[1].samples, 12);
        assert_eq!(summaries[1].label_counts.get(&Label::Unknown), Some(&1));
    }
}
