use crate::analyzer::Verdict;
use crate::monitor::source::DeviceInfo;
use crate::sample::{PeakState, Window};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Set when the latest cycles for a device failed transiently
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Staleness {
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: String,
}

/// Immutable bundle published once per device per cycle. Readers hold an
/// `Arc` to it, so they never observe a half-applied cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: DeviceInfo,
    pub window: Window,
    pub verdict: Verdict,
    pub peaks: PeakState,
    /// Timestamp of the newest accepted snapshot
    pub last_success: DateTime<Utc>,
    pub stale: Option<Staleness>,
}

impl DeviceReport {
    pub fn is_stale(&self) -> bool {
        self.stale.is_some()
    }

    /// Time since the last successful cycle
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_success
    }

    /// Same data, marked stale by one more failed cycle
    pub fn mark_stale(&self, now: DateTime<Utc>, error: String) -> Self {
        let stale = match &self.stale {
            Some(prev) => Staleness {
                since: prev.since,
                consecutive_failures: prev.consecutive_failures + 1,
                last_error: error,
            },
            None => Staleness {
                since: now,
                consecutive_failures: 1,
                last_error: error,
            },
        };
        Self {
            stale: Some(stale),
            ..self.clone()
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .verdict
            .label
            .recommendations()
            .into_iter()
            .map(str::to_string)
            .collect();
        if let Some(stale) = &self.stale {
            lines.push(format!(
                "Data is stale after {} failed samples: {}",
                stale.consecutive_failures, stale.last_error
            ));
        }
        lines
    }
}
