use crate::sample::{DeviceId, Metric};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bottleneck categories, declared in tie-break priority order:
/// hardware-protection conditions outrank throughput conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    ThermalThrottled,
    PowerLimited,
    MemoryBound,
    PcieBound,
    ComputeBound,
    Idle,
    Unknown,
}

impl Label {
    /// Every label the classifier scores; `Unknown` is only a fallback
    pub const SCORED: [Label; 6] = [
        Label::ThermalThrottled,
        Label::PowerLimited,
        Label::MemoryBound,
        Label::PcieBound,
        Label::ComputeBound,
        Label::Idle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Label::ThermalThrottled => "thermal-throttled",
            Label::PowerLimited => "power-limited",
            Label::MemoryBound => "memory-bound",
            Label::PcieBound => "pcie-bound",
            Label::ComputeBound => "compute-bound",
            Label::Idle => "idle",
            Label::Unknown => "unknown",
        }
    }

    pub fn recommendations(&self) -> Vec<&'static str> {
        match self {
            Label::ThermalThrottled => vec![
                "Clocks are dropping under thermal pressure",
                "Check airflow, fan curves and heatsink contact",
            ],
            Label::PowerLimited => vec![
                "Power draw is pinned at the board limit",
                "Raise the power limit if the board allows it, or expect capped clocks",
            ],
            Label::MemoryBound => vec![
                "Memory subsystem is saturated while compute units wait",
                "Improve data locality, fuse kernels or use lower-precision formats",
            ],
            Label::PcieBound => vec![
                "Host-device transfers dominate while the GPU is starved",
                "Batch transfers, pin host memory or keep data resident on the device",
            ],
            Label::ComputeBound => vec![
                "Compute units are saturated at full clocks",
                "This is the expected state for a well-fed workload",
            ],
            Label::Idle => vec!["No significant GPU activity"],
            Label::Unknown => vec!["Not enough data to classify yet"],
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A metric's share of a category score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub metric: Metric,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: Label,
    pub score: f64,
}

/// Classifier output for one device at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub device: DeviceId,
    /// Timestamp of the newest snapshot in the classified window
    pub timestamp: Option<DateTime<Utc>>,
    pub label: Label,
    pub confidence: f64,
    /// Metrics behind the winning label, largest contribution first
    pub contributing_metrics: Vec<Contribution>,
    /// Every scored category, best first
    pub ranking: Vec<LabelScore>,
    pub samples: usize,
}

impl Verdict {
    pub fn unknown(device: DeviceId, timestamp: Option<DateTime<Utc>>, samples: usize) -> Self {
        Self {
            device,
            timestamp,
            label: Label::Unknown,
            confidence: 0.0,
            contributing_metrics: Vec::new(),
            ranking: Vec::new(),
            samples,
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        if self.label == Label::Unknown {
            return format!("{}: unknown ({} samples)", self.device, self.samples);
        }

        let drivers: Vec<String> = self
            .contributing_metrics
            .iter()
            .map(|c| format!("{} {:.2}", c.metric, c.score))
            .collect();
        format!(
            "{}: {} ({:.0}% confidence) [{}]",
            self.device,
            self.label,
            self.confidence * 100.0,
            drivers.join(", ")
        )
    }
}
