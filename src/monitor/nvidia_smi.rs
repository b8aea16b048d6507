use crate::monitor::source::{DeviceInfo, MetricSource, SourceError};
use crate::sample::{DeviceId, Metric, Reading, Snapshot};
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const DEVICE_QUERY: &str = "index,name,uuid,pci.bus_id,memory.total,driver_version";

/// Query order for `sample`; `Metric::MemUsed`/`MemTotal` arrive in MiB
const SAMPLE_FIELDS: [(&str, Metric); 11] = [
    ("utilization.gpu", Metric::GpuUtil),
    ("utilization.memory", Metric::MemUtil),
    ("memory.used", Metric::MemUsed),
    ("memory.total", Metric::MemTotal),
    ("temperature.gpu", Metric::Temperature),
    ("power.draw", Metric::Power),
    ("power.limit", Metric::PowerLimit),
    ("clocks.gr", Metric::GpuClock),
    ("clocks.max.gr", Metric::GpuClockMax),
    ("clocks.mem", Metric::MemClock),
    ("fan.speed", Metric::FanSpeed),
];

/// Counter source backed by the `nvidia-smi` command line tool.
///
/// `nvidia-smi --query-gpu` exposes no PCIe utilization, so snapshots from
/// this source always carry `pcie_util_pct` as unavailable and `PcieBound`
/// is only reachable from synthetic or replayed data.
pub struct NvidiaSmiSource {
    binary: PathBuf,
    timeout: Duration,
}

impl NvidiaSmiSource {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Upper bound on one `nvidia-smi` invocation; a child still running
    /// after it is killed and reaped
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, args: &[String]) -> Result<String, SourceError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SourceError::Permanent(format!("{} not found", self.binary.display()))
                } else {
                    SourceError::Transient(format!("failed to run {}: {}", self.binary.display(), e))
                }
            })?;

        // Drained off-thread so a chatty child never stalls on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SourceError::Transient(format!(
                        "{} timed out after {}ms",
                        self.binary.display(),
                        self.timeout.as_millis()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SourceError::Transient(format!(
                        "waiting for {}: {}",
                        self.binary.display(),
                        e
                    )));
                }
            }
        };

        let stdout = collect(stdout);
        if status.success() {
            return Ok(stdout);
        }
        Err(classify_failure(&format!("{}{}", stdout, collect(stderr))))
    }

    /// CUDA driver API version from the plain `nvidia-smi` banner
    fn cuda_version(&self) -> Option<String> {
        self.run(&[]).ok().and_then(|text| parse_cuda_version(&text))
    }

    fn slowdown_temp(&self, device: DeviceId) -> Option<f64> {
        let args = vec![
            "-q".to_string(),
            "-d".to_string(),
            "TEMPERATURE".to_string(),
            "-i".to_string(),
            device.0.to_string(),
        ];
        self.run(&args).ok().and_then(|text| parse_slowdown_temp(&text))
    }
}

impl Default for NvidiaSmiSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for NvidiaSmiSource {
    fn devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let args = vec![
            format!("--query-gpu={}", DEVICE_QUERY),
            "--format=csv,noheader,nounits".to_string(),
        ];
        let output = self.run(&args)?;
        let cuda_version = self.cuda_version();

        let mut devices = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let mut info = parse_device_line(line)?;
            info.slowdown_temp_c = self.slowdown_temp(info.id);
            info.cuda_version = cuda_version.clone();
            devices.push(info);
        }
        Ok(devices)
    }

    fn sample(&self, device: DeviceId) -> Result<Snapshot, SourceError> {
        let fields: Vec<&str> = SAMPLE_FIELDS.iter().map(|(name, _)| *name).collect();
        let args = vec![
            format!("--query-gpu={}", fields.join(",")),
            "--format=csv,noheader,nounits".to_string(),
            "-i".to_string(),
            device.0.to_string(),
        ];
        let output = self.run(&args)?;
        let line = output
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| SourceError::Transient(format!("empty output for {}", device)))?;

        parse_sample_line(line, Utc::now())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }))
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Lost or missing devices are permanent; everything else is worth a retry
fn classify_failure(output: &str) -> SourceError {
    let message = output.trim().to_string();
    let lower = message.to_lowercase();
    let permanent = [
        "no devices were found",
        "gpu is lost",
        "unable to determine the device handle",
        "invalid combination of input arguments",
        "no such device",
    ];
    if permanent.iter().any(|p| lower.contains(p)) {
        SourceError::Permanent(message)
    } else {
        SourceError::Transient(message)
    }
}

/// Parse a single CSV field. `[N/A]` and `[Not Supported]` mean the
/// counter does not exist on this board.
pub fn parse_reading(field: &str) -> Reading {
    let field = field.trim();
    if field.is_empty() || field.starts_with('[') || field.eq_ignore_ascii_case("n/a") {
        return Reading::Unavailable;
    }
    match field.parse::<f64>() {
        Ok(value) => Reading::Present(value),
        Err(_) => Reading::Error,
    }
}

pub fn parse_sample_line(line: &str, timestamp: DateTime<Utc>) -> Result<Snapshot, SourceError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != SAMPLE_FIELDS.len() {
        return Err(SourceError::Transient(format!(
            "expected {} fields, got {}: {}",
            SAMPLE_FIELDS.len(),
            parts.len(),
            line.trim()
        )));
    }

    let mut snapshot = Snapshot::empty(timestamp);
    for ((_, metric), raw) in SAMPLE_FIELDS.iter().zip(parts) {
        let mut reading = parse_reading(raw);
        if matches!(metric, Metric::MemUsed | Metric::MemTotal) {
            if let Reading::Present(mib) = reading {
                reading = Reading::Present(mib * MIB);
            }
        }
        snapshot.set(*metric, reading);
    }
    Ok(snapshot)
}

pub fn parse_device_line(line: &str) -> Result<DeviceInfo, SourceError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 5 {
        return Err(SourceError::Transient(format!("malformed device line: {}", line.trim())));
    }

    let index: u32 = parts[0]
        .parse()
        .map_err(|_| SourceError::Transient(format!("bad device index: {}", parts[0])))?;
    let text = |s: &str| (!s.is_empty() && !s.starts_with('[')).then(|| s.to_string());

    Ok(DeviceInfo {
        id: DeviceId(index),
        name: parts[1].to_string(),
        uuid: text(parts[2]),
        pci_bus_id: text(parts[3]),
        memory_total_bytes: parse_reading(parts[4]).value().map(|mib| (mib * MIB) as u64),
        slowdown_temp_c: None,
        driver_version: parts.get(5).and_then(|s| text(*s)),
        cuda_version: None,
    })
}

/// Pull "GPU Slowdown Temp : 90 C" out of `nvidia-smi -q -d TEMPERATURE`
pub fn parse_slowdown_temp(text: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("gpu slowdown temp") {
            return None;
        }
        value.trim().trim_end_matches('C').trim().parse().ok()
    })
}

/// Pull "CUDA Version: 12.2" out of the plain `nvidia-smi` banner
pub fn parse_cuda_version(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("CUDA Version:")?;
    let version = rest.split_whitespace().next()?.trim_end_matches('|');
    (!version.is_empty() && !version.eq_ignore_ascii_case("n/a")).then(|| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_line() {
        let now = Utc::now();
        let line = "97, 41, 10240, 24576, 78, 285.40, 350.00, 1875, 2100, 10501, 65";
        let snap = parse_sample_line(line, now).unwrap();

        assert_eq!(snap.timestamp, now);
        assert_eq!(snap.gpu_util_pct, Reading::Present(97.0));
        assert_eq!(snap.mem_used_bytes, Reading::Present(10240.0 * MIB));
        assert_eq!(snap.power_limit_w, Reading::Present(350.0));
        assert_eq!(snap.gpu_clock_max_mhz, Reading::Present(2100.0));
        assert_eq!(snap.pcie_util_pct, Reading::Unavailable);
    }

    #[test]
    fn test_unsupported_fields_are_unavailable() {
        let line = "12, 3, 512, 8192, 40, [N/A], [Not Supported], 300, 1500, 405, [N/A]";
        let snap = parse_sample_line(line, Utc::now()).unwrap();
        assert_eq!(snap.power_w, Reading::Unavailable);
        assert_eq!(snap.power_limit_w, Reading::Unavailable);
        assert_eq!(snap.fan_speed_pct, Reading::Unavailable);
        assert_eq!(snap.temp_c, Reading::Present(40.0));
    }

    #[test]
    fn test_garbled_field_is_error() {
        assert_eq!(parse_reading("12x"), Reading::Error);
        assert_eq!(parse_reading(" 7.5 "), Reading::Present(7.5));
    }

    #[test]
    fn test_short_line_is_transient() {
        let err = parse_sample_line("1, 2, 3", Utc::now()).unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_parse_device_line() {
        let info = parse_device_line(
            "1, NVIDIA GeForce RTX 4090, GPU-5c3e-aa, 00000000:41:00.0, 24564, 550.54.15",
        )
        .unwrap();
        assert_eq!(info.id, DeviceId(1));
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.uuid.as_deref(), Some("GPU-5c3e-aa"));
        assert_eq!(info.memory_total_bytes, Some((24564.0 * MIB) as u64));
        assert_eq!(info.driver_version.as_deref(), Some("550.54.15"));

        let old = parse_device_line("0, Tesla T4, GPU-1, 00000000:00:04.0, 15360").unwrap();
        assert_eq!(old.driver_version, None);
    }

    #[test]
    fn test_parse_cuda_version() {
        let banner = "+---------------------------------------------------------------------------------------+\n\
                      | NVIDIA-SMI 535.104.05             Driver Version: 535.104.05   CUDA Version: 12.2     |\n\
                      |-----------------------------------------+----------------------+----------------------+\n";
        assert_eq!(parse_cuda_version(banner).as_deref(), Some("12.2"));
        assert_eq!(parse_cuda_version("| CUDA Version: N/A |"), None);
        assert_eq!(parse_cuda_version("No devices were found"), None);
    }

    #[test]
    fn test_live_source_never_reports_pcie() {
        assert!(SAMPLE_FIELDS.iter().all(|(_, metric)| *metric != Metric::PcieUtil));
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_command_is_killed() {
        let source = NvidiaSmiSource::with_binary("sleep").with_timeout(Duration::from_millis(100));
        let began = Instant::now();
        let err = source.run(&["5".to_string()]).unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(began.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_parse_slowdown_temp() {
        let text = "Temperature\n    GPU Current Temp                  : 45 C\n    GPU Shutdown Temp                 : 92 C\n    GPU Slowdown Temp                 : 89 C\n";
        assert_eq!(parse_slowdown_temp(text), Some(89.0));
        assert_eq!(parse_slowdown_temp("GPU Slowdown Temp : N/A"), None);
    }

    #[test]
    fn test_failure_classification() {
        assert!(classify_failure("No devices were found").is_permanent());
        assert!(classify_failure("Unable to determine the device handle for GPU 0000:41:00.0: GPU is lost").is_permanent());
        assert!(!classify_failure("Failed to initialize NVML: Driver/library version mismatch").is_permanent());
    }

    #[test]
    fn test_missing_binary_is_permanent() {
        let source = NvidiaSmiSource::with_binary("/nonexistent/nvidia-smi-for-tests");
        let err = source.sample(DeviceId(0)).unwrap_err();
        assert!(err.is_permanent());
    }
}
