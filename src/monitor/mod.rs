pub mod collector;
pub mod events;
pub mod nvidia_smi;
pub mod report;
pub mod source;
pub mod synthetic;

pub use collector::{Aggregator, CycleOutcome, CycleSummary};
pub use events::{DeviceEvent, EventHub, RemovalReason};
pub use nvidia_smi::NvidiaSmiSource;
pub use report::{DeviceReport, Staleness};
pub use source::{DeviceInfo, MetricSource, SourceError};
pub use synthetic::{Profile, SyntheticSource};
