use crate::sample::{DeviceId, Snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static description of an enumerated GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub uuid: Option<String>,
    pub pci_bus_id: Option<String>,
    pub memory_total_bytes: Option<u64>,
    /// Clock slowdown temperature reported by the driver
    pub slowdown_temp_c: Option<f64>,
    pub driver_version: Option<String>,
    /// CUDA driver API version, e.g. "12.2"
    pub cuda_version: Option<String>,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            uuid: None,
            pci_bus_id: None,
            memory_total_bytes: None,
            slowdown_temp_c: None,
            driver_version: None,
            cuda_version: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Momentary failure; retry on the next tick
    #[error("transient source failure: {0}")]
    Transient(String),

    /// The device is gone
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceError::Permanent(_))
    }
}

/// Supplier of raw counters. Calls may block; the scheduler runs them on
/// the blocking pool.
pub trait MetricSource: Send + Sync {
    /// Currently present devices
    fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError>;

    /// One snapshot for one device. Counters the device does not support
    /// come back as `Reading::Unavailable`.
    fn sample(&self, device: DeviceId) -> Result<Snapshot, SourceError>;
}
