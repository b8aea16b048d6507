use crate::sample::{Metric, Reading, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running extrema for one metric
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Peak {
    pub max_seen: Option<f64>,
    pub min_seen: Option<f64>,
    /// Static limit from configuration or the device, never derived from
    /// observations
    pub threshold_high: Option<f64>,
}

impl Peak {
    fn observe(&mut self, value: f64) {
        self.max_seen = Some(self.max_seen.map_or(value, |max| max.max(value)));
        self.min_seen = Some(self.min_seen.map_or(value, |min| min.min(value)));
    }

    /// Whether `value` sits at or above the configured threshold
    pub fn exceeds_threshold(&self, value: f64) -> bool {
        self.threshold_high.is_some_and(|limit| value >= limit)
    }
}

/// Owned copy of a tracker's state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeakState {
    pub metrics: BTreeMap<Metric, Peak>,
}

impl PeakState {
    pub fn get(&self, metric: Metric) -> Peak {
        self.metrics.get(&metric).copied().unwrap_or_default()
    }

    pub fn max(&self, metric: Metric) -> Option<f64> {
        self.get(metric).max_seen
    }

    pub fn threshold(&self, metric: Metric) -> Option<f64> {
        self.get(metric).threshold_high
    }
}

/// Per-device peak tracker
#[derive(Debug, Clone, Default)]
pub struct PeakTracker {
    state: PeakState,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds<I>(thresholds: I) -> Self
    where
        I: IntoIterator<Item = (Metric, f64)>,
    {
        let mut tracker = Self::new();
        for (metric, limit) in thresholds {
            tracker.set_threshold(metric, limit);
        }
        tracker
    }

    pub fn set_threshold(&mut self, metric: Metric, limit: f64) {
        self.state.metrics.entry(metric).or_default().threshold_high = Some(limit);
    }

    /// Fold one reading into the extrema. Anything but a finite present
    /// value is ignored.
    pub fn observe(&mut self, metric: Metric, reading: Reading) {
        let Some(value) = reading.value() else {
            return;
        };
        if !value.is_finite() {
            return;
        }
        self.state.metrics.entry(metric).or_default().observe(value);
    }

    pub fn observe_snapshot(&mut self, snapshot: &Snapshot) {
        for metric in Metric::ALL {
            self.observe(metric, snapshot.reading(metric));
        }
    }

    /// Forget all extrema; thresholds survive since they are configuration
    pub fn reset(&mut self) {
        self.state.metrics.retain(|_, peak| peak.threshold_high.is_some());
        for peak in self.state.metrics.values_mut() {
            peak.max_seen = None;
            peak.min_seen = None;
        }
    }

    pub fn get(&self, metric: Metric) -> Peak {
        self.state.get(metric)
    }

    pub fn snapshot(&self) -> PeakState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_extrema_are_monotonic() {
        let mut tracker = PeakTracker::new();
        let mut last_max = f64::MIN;
        let mut last_min = f64::MAX;

        for value in [50.0, 20.0, 80.0, 65.0, 10.0, 95.0, 30.0] {
            tracker.observe(Metric::GpuUtil, Reading::Present(value));
            let peak = tracker.get(Metric::GpuUtil);
            let max = peak.max_seen.unwrap();
            let min = peak.min_seen.unwrap();
            assert!(max >= last_max);
            assert!(min <= last_min);
            last_max = max;
            last_min = min;
        }

        assert_eq!(last_max, 95.0);
        assert_eq!(last_min, 10.0);
    }

    #[test]
    fn test_unavailable_readings_are_skipped() {
        let mut tracker = PeakTracker::new();
        tracker.observe(Metric::Power, Reading::Present(120.0));
        tracker.observe(Metric::Power, Reading::Unavailable);
        tracker.observe(Metric::Power, Reading::Error);
        tracker.observe(Metric::Power, Reading::Present(f64::NAN));

        let peak = tracker.get(Metric::Power);
        assert_eq!(peak.max_seen, Some(120.0));
        assert_eq!(peak.min_seen, Some(120.0));
        assert_eq!(tracker.get(Metric::FanSpeed), Peak::default());
    }

    #[test]
    fn test_reset_keeps_thresholds() {
        let mut tracker = PeakTracker::with_thresholds([(Metric::Temperature, 83.0)]);
        tracker.observe(Metric::Temperature, Reading::Present(70.0));
        tracker.observe(Metric::GpuUtil, Reading::Present(99.0));

        tracker.reset();

        let temp = tracker.get(Metric::Temperature);
        assert_eq!(temp.max_seen, None);
        assert_eq!(temp.threshold_high, Some(83.0));
        assert_eq!(tracker.get(Metric::GpuUtil), Peak::default());
        assert!(temp.exceeds_threshold(83.0));
        assert!(!temp.exceeds_threshold(82.9));
    }

    #[test]
    fn test_observe_snapshot_covers_every_metric() {
        let ts = DateTime::from_timestamp(1, 0).unwrap();
        let snap = Snapshot::empty(ts)
            .with(Metric::GpuClock, 1800.0)
            .with(Metric::MemClock, 9000.0);

        let mut tracker = PeakTracker::new();
        tracker.observe_snapshot(&snap);
        let state = tracker.snapshot();

        assert_eq!(state.max(Metric::GpuClock), Some(1800.0));
        assert_eq!(state.max(Metric::MemClock), Some(9000.0));
        assert_eq!(state.max(Metric::GpuUtil), None);
    }
}
