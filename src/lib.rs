//! GPU bottleneck classification: per-device sliding windows of counter
//! snapshots, peak tracking, and an explainable rule-based classifier
//! driven by a periodic multi-device sampler.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod monitor;
pub mod replay;
pub mod sample;

pub use analyzer::{Classifier, Label, Verdict};
pub use config::Config;
pub use error::{SonarError, SnapshotDefect};
pub use monitor::{Aggregator, DeviceEvent, DeviceReport, MetricSource};
pub use sample::{DeviceId, Metric, Reading, Snapshot};
