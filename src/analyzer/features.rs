use crate::config::Thresholds;
use crate::sample::{Metric, PeakState, Snapshot};

/// Device-level references the window is judged against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub temp_threshold_c: f64,
    /// Best known clock for the device: reported max or tracked peak
    pub clock_reference_mhz: Option<f64>,
}

impl Limits {
    pub fn new(temp_threshold_c: f64) -> Self {
        Self {
            temp_threshold_c,
            clock_reference_mhz: None,
        }
    }

    pub fn from_peaks(peaks: &PeakState, thresholds: &Thresholds) -> Self {
        let temp_threshold_c = peaks
            .threshold(Metric::Temperature)
            .unwrap_or(thresholds.default_temp_threshold_c);
        let clock_reference_mhz = max_opt(peaks.max(Metric::GpuClockMax), peaks.max(Metric::GpuClock));
        Self {
            temp_threshold_c,
            clock_reference_mhz,
        }
    }
}

/// Aggregates computed once per window. `None` means the underlying
/// counters were unavailable for the whole span.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Features {
    pub gpu_util: Option<f64>,
    pub mem_util: Option<f64>,
    pub pcie_util: Option<f64>,
    /// mem_util - gpu_util
    pub disparity: Option<f64>,
    pub mem_used_ratio: Option<f64>,
    pub temp_recent: Option<f64>,
    /// Degrees per second over the window
    pub temp_slope: Option<f64>,
    pub temp_threshold: f64,
    pub clock_peak: Option<f64>,
    /// Fractional drop of recent clocks below `clock_peak`
    pub clock_drop: Option<f64>,
    pub power_ratio: Option<f64>,
}

impl Features {
    /// Utilization levels use the whole window, thermal/clock/power state
    /// uses the most recent third of it.
    pub fn extract(window: &[Snapshot], limits: &Limits) -> Self {
        let recent = &window[window.len() - window.len().div_ceil(3)..];

        let gpu_util = mean(window.iter().filter_map(|s| s.gpu_util_pct.value()));
        let mem_util = mean(window.iter().filter_map(|s| s.mem_util_pct.value()));
        let disparity = match (gpu_util, mem_util) {
            (Some(gpu), Some(mem)) => Some(mem - gpu),
            _ => None,
        };

        let window_clock_peak = window
            .iter()
            .flat_map(|s| [s.gpu_clock_mhz.value(), s.gpu_clock_max_mhz.value()])
            .flatten()
            .fold(None, |acc, v| max_opt(acc, Some(v)));
        let clock_peak = max_opt(limits.clock_reference_mhz, window_clock_peak).filter(|p| *p > 0.0);
        let recent_clock = mean(recent.iter().filter_map(|s| s.gpu_clock_mhz.value()));
        let clock_drop = match (recent_clock, clock_peak) {
            (Some(clock), Some(peak)) => Some((1.0 - clock / peak).max(0.0)),
            _ => None,
        };

        Self {
            gpu_util,
            mem_util,
            pcie_util: mean(window.iter().filter_map(|s| s.pcie_util_pct.value())),
            disparity,
            mem_used_ratio: mean(window.iter().filter_map(Snapshot::mem_used_ratio)),
            temp_recent: mean(recent.iter().filter_map(|s| s.temp_c.value())),
            temp_slope: slope(window),
            temp_threshold: limits.temp_threshold_c,
            clock_peak,
            clock_drop,
            power_ratio: mean(recent.iter().filter_map(Snapshot::power_ratio)),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Least-squares temperature slope against the window's own timestamps
fn slope(window: &[Snapshot]) -> Option<f64> {
    let origin = window.first()?.timestamp;
    let points: Vec<(f64, f64)> = window
        .iter()
        .filter_map(|s| {
            let temp = s.temp_c.value()?;
            let secs = (s.timestamp - origin).num_milliseconds() as f64 / 1000.0;
            Some((secs, temp))
        })
        .collect();
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (cov, var) = points.iter().fold((0.0, 0.0), |(cov, var), (x, y)| {
        let dx = x - mean_x;
        (cov + dx * (y - mean_y), var + dx * dx)
    });
    (var > 0.0).then(|| cov / var)
}
