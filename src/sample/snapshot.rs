use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a GPU as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU {}", self.0)
    }
}

/// One counter reading. Missing hardware support is explicit, never a
/// sentinel number.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Present(f64),
    #[default]
    Unavailable,
    /// The counter exists but could not be read or parsed this tick
    Error,
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Present(v) => Some(*v),
            Reading::Unavailable | Reading::Error => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Reading::Present(_))
    }
}

impl From<Option<f64>> for Reading {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Reading::Unavailable, Reading::Present)
    }
}

/// Counters carried by a [`Snapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    GpuUtil,
    MemUtil,
    MemUsed,
    MemTotal,
    Temperature,
    Power,
    PowerLimit,
    GpuClock,
    GpuClockMax,
    MemClock,
    FanSpeed,
    PcieUtil,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::GpuUtil,
        Metric::MemUtil,
        Metric::MemUsed,
        Metric::MemTotal,
        Metric::Temperature,
        Metric::Power,
        Metric::PowerLimit,
        Metric::GpuClock,
        Metric::GpuClockMax,
        Metric::MemClock,
        Metric::FanSpeed,
        Metric::PcieUtil,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::GpuUtil => "gpu_util",
            Metric::MemUtil => "mem_util",
            Metric::MemUsed => "mem_used",
            Metric::MemTotal => "mem_total",
            Metric::Temperature => "temperature",
            Metric::Power => "power",
            Metric::PowerLimit => "power_limit",
            Metric::GpuClock => "gpu_clock",
            Metric::GpuClockMax => "gpu_clock_max",
            Metric::MemClock => "mem_clock",
            Metric::FanSpeed => "fan_speed",
            Metric::PcieUtil => "pcie_util",
        }
    }

    /// Percent-valued metrics are bounded to [0, 100]
    pub fn is_percent(&self) -> bool {
        matches!(
            self,
            Metric::GpuUtil | Metric::MemUtil | Metric::FanSpeed | Metric::PcieUtil
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw counters for one device at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub gpu_util_pct: Reading,
    #[serde(default)]
    pub mem_util_pct: Reading,
    #[serde(default)]
    pub mem_used_bytes: Reading,
    #[serde(default)]
    pub mem_total_bytes: Reading,
    #[serde(default)]
    pub temp_c: Reading,
    #[serde(default)]
    pub power_w: Reading,
    #[serde(default)]
    pub power_limit_w: Reading,
    #[serde(default)]
    pub gpu_clock_mhz: Reading,
    #[serde(default)]
    pub gpu_clock_max_mhz: Reading,
    #[serde(default)]
    pub mem_clock_mhz: Reading,
    #[serde(default)]
    pub fan_speed_pct: Reading,
    #[serde(default)]
    pub pcie_util_pct: Reading,
}

impl Snapshot {
    /// A snapshot with every counter unavailable
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            gpu_util_pct: Reading::Unavailable,
            mem_util_pct: Reading::Unavailable,
            mem_used_bytes: Reading::Unavailable,
            mem_total_bytes: Reading::Unavailable,
            temp_c: Reading::Unavailable,
            power_w: Reading::Unavailable,
            power_limit_w: Reading::Unavailable,
            gpu_clock_mhz: Reading::Unavailable,
            gpu_clock_max_mhz: Reading::Unavailable,
            mem_clock_mhz: Reading::Unavailable,
            fan_speed_pct: Reading::Unavailable,
            pcie_util_pct: Reading::Unavailable,
        }
    }

    pub fn reading(&self, metric: Metric) -> Reading {
        match metric {
            Metric::GpuUtil => self.gpu_util_pct,
            Metric::MemUtil => self.mem_util_pct,
            Metric::MemUsed => self.mem_used_bytes,
            Metric::MemTotal => self.mem_total_bytes,
            Metric::Temperature => self.temp_c,
            Metric::Power => self.power_w,
            Metric::PowerLimit => self.power_limit_w,
            Metric::GpuClock => self.gpu_clock_mhz,
            Metric::GpuClockMax => self.gpu_clock_max_mhz,
            Metric::MemClock => self.mem_clock_mhz,
            Metric::FanSpeed => self.fan_speed_pct,
            Metric::PcieUtil => self.pcie_util_pct,
        }
    }

    pub fn set(&mut self, metric: Metric, reading: Reading) {
        let slot = match metric {
            Metric::GpuUtil => &mut self.gpu_util_pct,
            Metric::MemUtil => &mut self.mem_util_pct,
            Metric::MemUsed => &mut self.mem_used_bytes,
            Metric::MemTotal => &mut self.mem_total_bytes,
            Metric::Temperature => &mut self.temp_c,
            Metric::Power => &mut self.power_w,
            Metric::PowerLimit => &mut self.power_limit_w,
            Metric::GpuClock => &mut self.gpu_clock_mhz,
            Metric::GpuClockMax => &mut self.gpu_clock_max_mhz,
            Metric::MemClock => &mut self.mem_clock_mhz,
            Metric::FanSpeed => &mut self.fan_speed_pct,
            Metric::PcieUtil => &mut self.pcie_util_pct,
        };
        *slot = reading;
    }

    /// Builder-style setter, mostly for sources and tests
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, Reading::Present(value));
        self
    }

    /// First present reading that is negative, non-finite, or an
    /// over-100 percentage
    pub fn first_out_of_range(&self) -> Option<(Metric, f64)> {
        Metric::ALL.iter().find_map(|&metric| {
            let value = self.reading(metric).value()?;
            let bad = !value.is_finite() || value < 0.0 || (metric.is_percent() && value > 100.0);
            bad.then_some((metric, value))
        })
    }

    /// Used/total memory ratio when both are known
    pub fn mem_used_ratio(&self) -> Option<f64> {
        let used = self.mem_used_bytes.value()?;
        let total = self.mem_total_bytes.value()?;
        (total > 0.0).then(|| used / total)
    }

    /// Power draw over power limit when both are known
    pub fn power_ratio(&self) -> Option<f64> {
        let draw = self.power_w.value()?;
        let limit = self.power_limit_w.value()?;
        (limit > 0.0).then(|| draw / limit)
    }
}
