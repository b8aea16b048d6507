use crate::sample::{DeviceId, Metric};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by the sampling and classification core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SonarError {
    #[error("invalid snapshot for {device}: {defect}")]
    InvalidSnapshot {
        device: DeviceId,
        defect: SnapshotDefect,
    },

    #[error("{0} is not registered")]
    UnknownDevice(DeviceId),

    #[error("{0} is already registered")]
    AlreadyRegistered(DeviceId),
}

/// Why a snapshot was rejected by a sample buffer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SnapshotDefect {
    #[error("timestamp {timestamp} is not after {last}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("{metric} reading {value} is out of range")]
    OutOfRange { metric: Metric, value: f64 },
}

pub type Result<T> = std::result::Result<T, SonarError>;
