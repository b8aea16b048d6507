use crate::analyzer::features::{Features, Limits};
use crate::analyzer::verdict::{Contribution, Label, LabelScore, Verdict};
use crate::config::Thresholds;
use crate::sample::{DeviceId, Metric, PeakState, Snapshot};
use std::cmp::Ordering;

/// Minimum window length the classifier will judge
pub const MIN_SAMPLES: usize = 2;

/// Score for one category, with the per-metric breakdown that sums to it
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub label: Label,
    pub score: f64,
    pub contributions: Vec<Contribution>,
}

impl CategoryScore {
    fn zero(label: Label) -> Self {
        Self {
            label,
            score: 0.0,
            contributions: Vec::new(),
        }
    }
}

/// One weighted factor of a category score. `value` is `None` when the
/// metric behind it was unavailable, which drops the term entirely.
struct Term {
    metric: Metric,
    weight: f64,
    value: Option<f64>,
}

impl Term {
    fn new(metric: Metric, weight: f64, value: Option<f64>) -> Self {
        Self {
            metric,
            weight,
            value,
        }
    }
}

/// Deterministic rule-based bottleneck classifier
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Classify a window using limits derived from the device's peaks
    pub fn classify_with_peaks(
        &self,
        device: DeviceId,
        window: &[Snapshot],
        peaks: &PeakState,
    ) -> Verdict {
        let limits = Limits::from_peaks(peaks, &self.thresholds);
        self.classify(device, window, &limits)
    }

    /// Same inputs always produce the same verdict
    pub fn classify(&self, device: DeviceId, window: &[Snapshot], limits: &Limits) -> Verdict {
        let timestamp = window.last().map(|s| s.timestamp);
        if window.len() < MIN_SAMPLES {
            return Verdict::unknown(device, timestamp, window.len());
        }

        let features = Features::extract(window, limits);
        let mut scores = self.score_all(&features);
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.label.cmp(&b.label))
        });

        let ranking = scores
            .iter()
            .map(|s| LabelScore {
                label: s.label,
                score: s.score,
            })
            .collect();

        let top = &scores[0];
        if top.score <= 0.0 {
            let mut verdict = Verdict::unknown(device, timestamp, window.len());
            verdict.ranking = ranking;
            return verdict;
        }

        let runner_up = scores.get(1).map_or(0.0, |s| s.score);
        let confidence = top.score * (0.5 + 0.5 * (top.score - runner_up) / top.score);

        Verdict {
            device,
            timestamp,
            label: top.label,
            confidence: confidence.clamp(0.0, 1.0),
            contributing_metrics: top.contributions.clone(),
            ranking,
            samples: window.len(),
        }
    }

    /// Score every category independently
    pub fn score_all(&self, f: &Features) -> Vec<CategoryScore> {
        Label::SCORED
            .iter()
            .map(|&label| match label {
                Label::ThermalThrottled => self.thermal(f),
                Label::PowerLimited => self.power(f),
                Label::MemoryBound => self.memory(f),
                Label::PcieBound => self.pcie(f),
                Label::ComputeBound => self.compute(f),
                Label::Idle => self.idle(f),
                Label::Unknown => CategoryScore::zero(label),
            })
            .collect()
    }

    fn busy(&self, f: &Features) -> Option<f64> {
        let busy = self.thresholds.busy_util_pct;
        f.gpu_util.map(|u| ramp(u, busy - 40.0, busy))
    }

    /// Saturates once clocks sit `clock_drop_margin` below the reference
    fn clock_depressed(&self, f: &Features) -> Option<f64> {
        let margin = self.thresholds.clock_drop_margin;
        f.clock_drop.map(|d| ramp(d, margin * 0.5, margin))
    }

    fn heat(&self, f: &Features) -> Option<f64> {
        f.temp_recent
            .map(|t| ramp(t, f.temp_threshold - 5.0, f.temp_threshold))
    }

    fn power_capped(&self, f: &Features) -> Option<f64> {
        let margin = self.thresholds.power_margin;
        f.power_ratio
            .map(|r| ramp(r, 1.0 - margin * 3.0, 1.0 - margin * 0.5))
    }

    /// Hot and slowing down while still busy. Temperature alone is not
    /// throttling.
    fn thermal(&self, f: &Features) -> CategoryScore {
        let heat = self.heat(f);
        let drop = self.clock_depressed(f);
        let busy = self.busy(f);
        combine(
            Label::ThermalThrottled,
            gate([heat, drop], [busy]),
            &[
                Term::new(Metric::Temperature, 0.4, heat),
                Term::new(Metric::GpuClock, 0.35, drop),
                Term::new(Metric::GpuUtil, 0.15, busy),
                // A flat or cooling trend adds nothing rather than diluting
                Term::new(
                    Metric::Temperature,
                    0.1,
                    f.temp_slope.filter(|s| *s > 0.0).map(|s| ramp(s, 0.0, 0.5)),
                ),
            ],
        )
    }

    fn power(&self, f: &Features) -> CategoryScore {
        let capped = self.power_capped(f);
        let drop = self.clock_depressed(f);
        let busy = self.busy(f);
        combine(
            Label::PowerLimited,
            gate([capped, drop], [busy]),
            &[
                Term::new(Metric::Power, 0.5, capped),
                Term::new(Metric::GpuClock, 0.35, drop),
                Term::new(Metric::GpuUtil, 0.15, busy),
            ],
        )
    }

    /// Memory saturated while compute idles
    fn memory(&self, f: &Features) -> CategoryScore {
        let busy = self.thresholds.busy_util_pct;
        let saturated = f.mem_util.map(|m| ramp(m, busy * 0.45, busy * 0.95));
        let dominant = f
            .disparity
            .map(|d| ramp(d, 0.0, self.thresholds.memory_disparity_pct));
        combine(
            Label::MemoryBound,
            gate([saturated, dominant], []),
            &[
                Term::new(Metric::MemUtil, 0.55, saturated),
                Term::new(Metric::GpuUtil, 0.45, dominant),
            ],
        )
    }

    fn pcie(&self, f: &Features) -> CategoryScore {
        let sat = self.thresholds.pcie_saturation_pct;
        let saturated = f.pcie_util.map(|p| ramp(p, sat - 40.0, sat));
        let starved = self.busy(f).map(|b| 1.0 - b);
        combine(
            Label::PcieBound,
            gate([saturated], [starved]),
            &[
                Term::new(Metric::PcieUtil, 0.6, saturated),
                Term::new(Metric::GpuUtil, 0.4, starved),
            ],
        )
    }

    /// Busy at full clocks with no thermal or power signature
    fn compute(&self, f: &Features) -> CategoryScore {
        let busy_pct = self.thresholds.busy_util_pct;
        let busy = f.gpu_util.map(|u| ramp(u, busy_pct - 60.0, busy_pct));
        let near_peak = self.clock_depressed(f).map(|d| 1.0 - d);
        let mem_quiet = f
            .disparity
            .map(|d| 1.0 - ramp(d, 0.0, self.thresholds.memory_disparity_pct));

        let thermal_sig = gate([self.heat(f), self.clock_depressed(f)], []).unwrap_or(0.0);
        let power_sig = gate([self.power_capped(f), self.clock_depressed(f)], []).unwrap_or(0.0);
        let signature = gate([busy], [near_peak, mem_quiet])
            .map(|g| g * (1.0 - thermal_sig) * (1.0 - power_sig));

        combine(
            Label::ComputeBound,
            signature,
            &[
                Term::new(Metric::GpuUtil, 0.6, busy),
                Term::new(Metric::GpuClock, 0.25, near_peak),
                Term::new(Metric::MemUtil, 0.15, mem_quiet),
            ],
        )
    }

    fn idle(&self, f: &Features) -> CategoryScore {
        let idle = self.thresholds.idle_util_pct;
        let quiet = |u: f64| 1.0 - ramp(u, idle, idle * 3.0);
        let gpu_quiet = f.gpu_util.map(quiet);
        let mem_quiet = f.mem_util.map(quiet);
        combine(
            Label::Idle,
            gate([gpu_quiet], [mem_quiet]),
            &[
                Term::new(Metric::GpuUtil, 0.6, gpu_quiet),
                Term::new(Metric::MemUtil, 0.4, mem_quiet),
            ],
        )
    }
}

/// Linear ramp from 0 at `lo` to 1 at `hi`
fn ramp(x: f64, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        return if x >= hi { 1.0 } else { 0.0 };
    }
    ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Signature gate: the weakest factor. Any missing required factor
/// yields `None`; missing optional factors are skipped.
fn gate<const R: usize, const O: usize>(
    required: [Option<f64>; R],
    optional: [Option<f64>; O],
) -> Option<f64> {
    let mut weakest = 1.0f64;
    for factor in required {
        weakest = weakest.min(factor?);
    }
    for factor in optional.into_iter().flatten() {
        weakest = weakest.min(factor);
    }
    Some(weakest)
}

/// `gate × weighted mean of the available terms`, attributed per metric
fn combine(label: Label, gate: Option<f64>, terms: &[Term]) -> CategoryScore {
    let Some(gate) = gate.filter(|g| *g > 0.0) else {
        return CategoryScore::zero(label);
    };

    let total_weight: f64 = terms
        .iter()
        .filter(|t| t.value.is_some())
        .map(|t| t.weight)
        .sum();
    if total_weight <= 0.0 {
        return CategoryScore::zero(label);
    }

    let mut contributions: Vec<Contribution> = Vec::new();
    for term in terms {
        let Some(value) = term.value else { continue };
        let share = gate * term.weight * value / total_weight;
        if share <= 0.0 {
            continue;
        }
        match contributions.iter_mut().find(|c| c.metric == term.metric) {
            Some(existing) => existing.score += share,
            None => contributions.push(Contribution {
                metric: term.metric,
                score: share,
            }),
        }
    }

    contributions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.metric.cmp(&b.metric))
    });
    let score = contributions.iter().map(|c| c.score).sum::<f64>().clamp(0.0, 1.0);

    CategoryScore {
        label,
        score,
        contributions,
    }
}
