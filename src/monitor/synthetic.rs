use crate::monitor::source::{DeviceInfo, MetricSource, SourceError};
use crate::sample::{DeviceId, Metric, Snapshot};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Workload shape a synthetic device imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Compute,
    Memory,
    Thermal,
    Power,
    Pcie,
    Idle,
}

impl std::str::FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compute" => Ok(Profile::Compute),
            "memory" | "mem" => Ok(Profile::Memory),
            "thermal" | "hot" => Ok(Profile::Thermal),
            "power" => Ok(Profile::Power),
            "pcie" => Ok(Profile::Pcie),
            "idle" => Ok(Profile::Idle),
            _ => Err(anyhow::anyhow!(
                "Invalid profile: {}. Valid options: compute, memory, thermal, power, pcie, idle",
                s
            )),
        }
    }
}

const CLOCK_MAX_MHZ: f64 = 1950.0;
const POWER_LIMIT_W: f64 = 350.0;
const MEM_TOTAL_BYTES: f64 = 24.0 * 1024.0 * 1024.0 * 1024.0;

struct SimDevice {
    profile: Profile,
    rng: StdRng,
    tick: u64,
    last: Option<DateTime<Utc>>,
    failures_left: u32,
    removed: bool,
}

impl SimDevice {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last = Some(ts);
        ts
    }

    fn generate(&mut self) -> Snapshot {
        let timestamp = self.next_timestamp();
        let t = self.tick as f64;
        self.tick += 1;
        let rng = &mut self.rng;
        let mut jitter = |lo: f64, hi: f64| rng.gen_range(lo..=hi);

        // (gpu util, mem util, temp, power, clock, pcie)
        let (gpu, mem, temp, power, clock, pcie) = match self.profile {
            Profile::Compute => (
                jitter(95.0, 99.0),
                jitter(35.0, 45.0),
                jitter(69.0, 71.0),
                jitter(240.0, 260.0),
                jitter(1920.0, CLOCK_MAX_MHZ),
                jitter(5.0, 10.0),
            ),
            Profile::Memory => (
                jitter(15.0, 25.0),
                jitter(85.0, 95.0),
                jitter(59.0, 61.0),
                jitter(170.0, 190.0),
                jitter(1900.0, CLOCK_MAX_MHZ),
                jitter(5.0, 10.0),
            ),
            Profile::Thermal => {
                // Heats past the slowdown point, then sheds clock
                let heat = t.min(10.0);
                (
                    jitter(95.0, 99.0),
                    jitter(28.0, 32.0),
                    80.0 + heat * 0.8 + jitter(-0.2, 0.2),
                    jitter(280.0, 300.0),
                    CLOCK_MAX_MHZ - heat * 45.0 + jitter(-5.0, 5.0),
                    jitter(5.0, 10.0),
                )
            }
            Profile::Power => (
                jitter(96.0, 99.0),
                jitter(45.0, 55.0),
                jitter(71.0, 73.0),
                jitter(345.0, POWER_LIMIT_W),
                jitter(1580.0, 1620.0),
                jitter(5.0, 10.0),
            ),
            Profile::Pcie => (
                jitter(25.0, 35.0),
                jitter(15.0, 25.0),
                jitter(50.0, 52.0),
                jitter(120.0, 140.0),
                jitter(1900.0, CLOCK_MAX_MHZ),
                jitter(92.0, 97.0),
            ),
            Profile::Idle => (
                jitter(0.0, 2.0),
                jitter(0.0, 2.0),
                jitter(34.0, 36.0),
                jitter(18.0, 22.0),
                jitter(200.0, 220.0),
                jitter(0.0, 1.0),
            ),
        };

        Snapshot::empty(timestamp)
            .with(Metric::GpuUtil, gpu)
            .with(Metric::MemUtil, mem)
            .with(Metric::MemUsed, MEM_TOTAL_BYTES * mem / 200.0)
            .with(Metric::MemTotal, MEM_TOTAL_BYTES)
            .with(Metric::Temperature, temp)
            .with(Metric::Power, power)
            .with(Metric::PowerLimit, POWER_LIMIT_W)
            .with(Metric::GpuClock, clock)
            .with(Metric::GpuClockMax, CLOCK_MAX_MHZ)
            .with(Metric::MemClock, 10_501.0)
            .with(Metric::FanSpeed, (temp - 20.0).clamp(30.0, 100.0))
            .with(Metric::PcieUtil, pcie)
    }
}

/// Seeded fake GPUs with fault injection, for demos and tests
pub struct SyntheticSource {
    seed: u64,
    devices: Mutex<BTreeMap<DeviceId, SimDevice>>,
}

impl SyntheticSource {
    pub fn new(seed: u64, profiles: &[Profile]) -> Self {
        let source = Self {
            seed,
            devices: Mutex::new(BTreeMap::new()),
        };
        for profile in profiles {
            source.add(*profile);
        }
        source
    }

    /// Plug in another device; returns its id
    pub fn add(&self, profile: Profile) -> DeviceId {
        let mut devices = self.devices.lock();
        let id = DeviceId(devices.keys().next_back().map_or(0, |id| id.0 + 1));
        devices.insert(
            id,
            SimDevice {
                profile,
                rng: StdRng::seed_from_u64(self.seed.wrapping_add(id.0 as u64)),
                tick: 0,
                last: None,
                failures_left: 0,
                removed: false,
            },
        );
        id
    }

    /// Make the next `count` samples of `device` fail transiently
    pub fn fail_transient(&self, device: DeviceId, count: u32) {
        if let Some(dev) = self.devices.lock().get_mut(&device) {
            dev.failures_left = count;
        }
    }

    /// Simulate the device falling off the bus
    pub fn remove(&self, device: DeviceId) {
        if let Some(dev) = self.devices.lock().get_mut(&device) {
            dev.removed = true;
        }
    }
}

impl MetricSource for SyntheticSource {
    fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let devices = self.devices.lock();
        Ok(devices
            .iter()
            .filter(|(_, dev)| !dev.removed)
            .map(|(id, dev)| DeviceInfo {
                id: *id,
                name: format!("Synthetic {:?} GPU", dev.profile),
                uuid: Some(format!("GPU-synthetic-{}", id.0)),
                pci_bus_id: None,
                memory_total_bytes: Some(MEM_TOTAL_BYTES as u64),
                slowdown_temp_c: Some(83.0),
                driver_version: None,
                cuda_version: None,
            })
            .collect())
    }

    fn sample(&self, device: DeviceId) -> Result<Snapshot, SourceError> {
        let mut devices = self.devices.lock();
        let dev = devices
            .get_mut(&device)
            .ok_or_else(|| SourceError::Permanent(format!("{} does not exist", device)))?;

        if dev.removed {
            return Err(SourceError::Permanent(format!("{} was removed", device)));
        }
        if dev.failures_left > 0 {
            dev.failures_left -= 1;
            return Err(SourceError::Transient(format!("{} is not responding", device)));
        }
        Ok(dev.generate())
    }
}
