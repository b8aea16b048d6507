use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Sampler configuration. Every numeric threshold is a tunable default,
/// not a physical guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Snapshots kept per device (K)
    pub window_size: usize,
    pub interval_ms: u64,
    /// Upper bound on a single source call before it counts as transient
    pub sample_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Re-enumerate devices every N cycles
    pub rescan_every: u32,
    pub thresholds: Thresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: 20,
            interval_ms: 1000,
            sample_timeout_ms: 2000,
            shutdown_timeout_ms: 3000,
            rescan_every: 10,
            thresholds: Thresholds::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            bail!("window_size must be at least 2, got {}", self.window_size);
        }
        if self.interval_ms == 0 {
            bail!("interval_ms must be positive");
        }
        if self.sample_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            bail!("timeouts must be positive");
        }
        if self.rescan_every == 0 {
            bail!("rescan_every must be positive");
        }
        self.thresholds.validate()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Classification knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Used when the device does not report a slowdown temperature
    pub default_temp_threshold_c: f64,
    /// Relative clock drop below peak that counts as throttling
    pub clock_drop_margin: f64,
    /// How close to the power limit counts as capped
    pub power_margin: f64,
    pub busy_util_pct: f64,
    pub idle_util_pct: f64,
    /// mem_util minus gpu_util at which memory is considered dominant
    pub memory_disparity_pct: f64,
    pub pcie_saturation_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            default_temp_threshold_c: 83.0,
            clock_drop_margin: 0.10,
            power_margin: 0.05,
            busy_util_pct: 90.0,
            idle_util_pct: 5.0,
            memory_disparity_pct: 30.0,
            pcie_saturation_pct: 90.0,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        for (name, margin) in [
            ("clock_drop_margin", self.clock_drop_margin),
            ("power_margin", self.power_margin),
        ] {
            if !(margin > 0.0 && margin < 1.0) {
                bail!("{} must be within (0, 1), got {}", name, margin);
            }
        }
        for (name, pct) in [
            ("busy_util_pct", self.busy_util_pct),
            ("idle_util_pct", self.idle_util_pct),
            ("memory_disparity_pct", self.memory_disparity_pct),
            ("pcie_saturation_pct", self.pcie_saturation_pct),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                bail!("{} must be within (0, 100], got {}", name, pct);
            }
        }
        if self.idle_util_pct >= self.busy_util_pct {
            bail!("idle_util_pct must be below busy_util_pct");
        }
        if self.default_temp_threshold_c <= 0.0 {
            bail!("default_temp_threshold_c must be positive");
        }
        Ok(())
    }
}

/// Parse human-readable durations (e.g., "250ms", "2s", "1m")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = s.strip_suffix('s') {
        (num, "s")
    } else if let Some(num) = s.strip_suffix('m') {
        (num, "m")
    } else {
        // Assume seconds if no unit
        (s.as_str(), "s")
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number in duration: {}", s))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        _ => bail!("Invalid unit in duration: {}", s),
    };

    if duration.is_zero() {
        bail!("Duration must be positive: {}", s);
    }
    Ok(duration)
}
