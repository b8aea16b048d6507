use crate::error::{Result, SnapshotDefect, SonarError};
use crate::sample::{DeviceId, Snapshot};
use std::collections::VecDeque;
use std::sync::Arc;

/// Immutable, ordered copy of a device's recent snapshots
pub type Window = Arc<[Snapshot]>;

/// Fixed-capacity ring of the most recent snapshots for one device
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    device: DeviceId,
    capacity: usize,
    entries: VecDeque<Snapshot>,
}

impl SampleBuffer {
    pub fn new(device: DeviceId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            device,
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a snapshot, evicting the oldest one when full.
    ///
    /// Rejects snapshots whose timestamp does not strictly follow the last
    /// accepted one, and snapshots carrying out-of-range readings. A
    /// rejected push leaves the buffer untouched.
    pub fn push(&mut self, snapshot: Snapshot) -> Result<()> {
        if let Some(last) = self.entries.back() {
            if snapshot.timestamp <= last.timestamp {
                return Err(self.invalid(SnapshotDefect::OutOfOrder {
                    timestamp: snapshot.timestamp,
                    last: last.timestamp,
                }));
            }
        }

        if let Some((metric, value)) = snapshot.first_out_of_range() {
            return Err(self.invalid(SnapshotDefect::OutOfRange { metric, value }));
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
        Ok(())
    }

    /// Oldest-first copy of the buffered snapshots
    pub fn window(&self) -> Window {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn invalid(&self, defect: SnapshotDefect) -> SonarError {
        SonarError::InvalidSnapshot {
            device: self.device,
            defect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Metric;
    use chrono::{DateTime, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn snap(secs: i64) -> Snapshot {
        Snapshot::empty(ts(secs)).with(Metric::GpuUtil, secs as f64)
    }

    #[test]
    fn test_warm_up_returns_fewer_than_capacity() {
        let mut buffer = SampleBuffer::new(DeviceId(0), 4);
        buffer.push(snap(1)).unwrap();
        buffer.push(snap(2)).unwrap();

        let window = buffer.window();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].timestamp, ts(1));
        assert_eq!(window[1].timestamp, ts(2));
    }

    #[test]
    fn test_window_holds_exactly_last_k() {
        let mut buffer = SampleBuffer::new(DeviceId(0), 3);
        for secs in 1..=10 {
            buffer.push(snap(secs)).unwrap();
            assert!(buffer.len() <= 3);
        }

        let stamps: Vec<_> = buffer.window().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![ts(8), ts(9), ts(10)]);
    }

    #[test]
    fn test_window_is_ordered_for_any_valid_sequence() {
        let mut buffer = SampleBuffer::new(DeviceId(1), 5);
        let mut secs = 0;
        let mut pushed = Vec::new();
        for step in [1, 3, 1, 7, 2, 2, 9, 1, 4, 5, 1, 1] {
            secs += step;
            buffer.push(snap(secs)).unwrap();
            pushed.push(ts(secs));
        }

        let window = buffer.window();
        assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let tail: Vec<_> = pushed[pushed.len() - 5..].to_vec();
        let got: Vec<_> = window.iter().map(|s| s.timestamp).collect();
        assert_eq!(got, tail);
    }

    #[test]
    fn test_rejects_stale_and_equal_timestamps() {
        let mut buffer = SampleBuffer::new(DeviceId(2), 4);
        buffer.push(snap(5)).unwrap();
        buffer.push(snap(6)).unwrap();
        let before = buffer.window();

        let err = buffer.push(snap(6)).unwrap_err();
        assert!(matches!(
            err,
            SonarError::InvalidSnapshot {
                device: DeviceId(2),
                defect: SnapshotDefect::OutOfOrder { .. }
            }
        ));
        assert!(buffer.push(snap(3)).is_err());
        assert_eq!(buffer.window(), before);
    }

    #[test]
    fn test_rejects_out_of_range_reading() {
        let mut buffer = SampleBuffer::new(DeviceId(0), 4);
        let bad = Snapshot::empty(ts(1)).with(Metric::GpuUtil, 140.0);
        let err = buffer.push(bad).unwrap_err();
        assert!(matches!(
            err,
            SonarError::InvalidSnapshot {
                defect: SnapshotDefect::OutOfRange {
                    metric: Metric::GpuUtil,
                    ..
                },
                ..
            }
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_allows_restart() {
        let mut buffer = SampleBuffer::new(DeviceId(0), 2);
        buffer.push(snap(10)).unwrap();
        buffer.clear();
        buffer.push(snap(1)).unwrap();
        assert_eq!(buffer.len(), 1);
    }
}
