use crate::analyzer::Classifier;
use crate::config::Config;
use crate::error::{Result, SonarError};
use crate::monitor::events::{DeviceEvent, EventHub, RemovalReason};
use crate::monitor::report::DeviceReport;
use crate::monitor::source::{DeviceInfo, MetricSource, SourceError};
use crate::sample::{DeviceId, Metric, PeakTracker, SampleBuffer, Snapshot};
use chrono::Utc;
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one device's share of a cycle ended in
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Published(Arc<DeviceReport>),
    /// Transient failure; carries the re-published stale report if the
    /// device had produced one before
    Stale(Option<Arc<DeviceReport>>),
    /// The snapshot failed validation; state is unchanged
    Rejected,
    /// Permanent failure; the device has been deregistered
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub published: usize,
    pub stale: usize,
    pub rejected: usize,
    pub removed: usize,
}

struct DeviceState {
    buffer: SampleBuffer,
    peaks: PeakTracker,
}

/// Everything the aggregator keeps for one registered device
struct DeviceSlot {
    info: DeviceInfo,
    state: Mutex<DeviceState>,
    published: RwLock<Option<Arc<DeviceReport>>>,
    /// Set while a source call for this device is still running, including
    /// one whose cycle already gave up on it
    sampling: Arc<AtomicBool>,
}

/// Marks a blocking source call as outstanding until dropped
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    /// `None` while an earlier call holding the same flag has not returned
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared {
    source: Arc<dyn MetricSource>,
    config: Config,
    classifier: Classifier,
    devices: RwLock<BTreeMap<DeviceId, Arc<DeviceSlot>>>,
    hub: EventHub,
    cycles: AtomicU64,
    enumerating: Arc<AtomicBool>,
}

/// Periodic sampler: pulls snapshots for every registered device, keeps
/// per-device windows and peaks, classifies, and publishes reports.
pub struct Aggregator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Aggregator {
    pub fn new(source: Arc<dyn MetricSource>, config: Config) -> Self {
        let classifier = Classifier::new(config.thresholds.clone());
        Self {
            shared: Arc::new(Shared {
                source,
                config,
                classifier,
                devices: RwLock::new(BTreeMap::new()),
                hub: EventHub::new(),
                cycles: AtomicU64::new(0),
                enumerating: Arc::new(AtomicBool::new(false)),
            }),
            cancel: CancellationToken::new(),
            driver: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn register(&self, info: DeviceInfo) -> Result<()> {
        self.shared.register(info)
    }

    pub fn deregister(&self, id: DeviceId) -> Result<()> {
        self.shared.deregister(id, RemovalReason::Deregistered)
    }

    /// Event stream of device additions, removals and per-cycle reports
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.shared.hub.subscribe()
    }

    pub fn latest(&self, id: DeviceId) -> Option<Arc<DeviceReport>> {
        let slot = self.shared.devices.read().get(&id).cloned()?;
        let report = slot.published.read().clone();
        report
    }

    /// Latest report of every registered device that has produced one
    pub fn reports(&self) -> Vec<Arc<DeviceReport>> {
        let slots: Vec<_> = self.shared.devices.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.published.read().clone())
            .collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.shared.devices.read().keys().copied().collect()
    }

    /// Re-enumerate devices from the source
    pub async fn rescan(&self) {
        self.shared.rescan().await;
    }

    /// Run one sampling cycle across all devices
    pub async fn run_cycle(&self) -> CycleSummary {
        self.shared.run_cycle().await
    }

    /// Spawn the periodic driver
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let interval = shared.config.interval();

        self.driver = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("abandoning in-flight cycle");
                                break;
                            }
                            summary = shared.run_cycle() => {
                                debug!(
                                    published = summary.published,
                                    stale = summary.stale,
                                    rejected = summary.rejected,
                                    removed = summary.removed,
                                    "cycle complete",
                                );
                            }
                        }
                    }
                }
            }
        }));

        info!(interval_ms = interval.as_millis() as u64, "sampler started");
    }

    /// Stop the driver, waiting up to the configured shutdown timeout
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        let Some(mut handle) = self.driver.take() else {
            return;
        };
        let timeout = self.shared.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("sampler stopped"),
            Ok(Err(e)) => warn!(error = %e, "sampler task ended abnormally"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "sampler did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    fn register(&self, info: DeviceInfo) -> Result<()> {
        let id = info.id;
        {
            let mut devices = self.devices.write();
            if devices.contains_key(&id) {
                return Err(SonarError::AlreadyRegistered(id));
            }

            let temp_limit = info
                .slowdown_temp_c
                .unwrap_or(self.config.thresholds.default_temp_threshold_c);
            let state = DeviceState {
                buffer: SampleBuffer::new(id, self.config.window_size),
                peaks: PeakTracker::with_thresholds([(Metric::Temperature, temp_limit)]),
            };
            devices.insert(
                id,
                Arc::new(DeviceSlot {
                    info: info.clone(),
                    state: Mutex::new(state),
                    published: RwLock::new(None),
                    sampling: Arc::new(AtomicBool::new(false)),
                }),
            );
        }

        info!(device = %id, name = %info.name, "device registered");
        self.hub.publish(DeviceEvent::Added(info));
        Ok(())
    }

    fn deregister(&self, id: DeviceId, reason: RemovalReason) -> Result<()> {
        // Dropping the slot discards its window and peaks
        if self.devices.write().remove(&id).is_none() {
            return Err(SonarError::UnknownDevice(id));
        }

        info!(device = %id, reason = ?reason, "device deregistered");
        self.hub.publish(DeviceEvent::Removed { id, reason });
        Ok(())
    }

    fn is_current(&self, slot: &Arc<DeviceSlot>) -> bool {
        self.devices
            .read()
            .get(&slot.info.id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    async fn rescan(&self) {
        let Some(guard) = InFlight::acquire(&self.enumerating) else {
            debug!("previous device enumeration still running, skipping rescan");
            return;
        };

        let source = Arc::clone(&self.source);
        let timeout = self.config.sample_timeout();
        let listed = match tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                source.devices()
            }),
        )
        .await
        {
            Ok(Ok(Ok(listed))) => listed,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "device enumeration failed");
                return;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "device enumeration task failed");
                return;
            }
            Err(_) => {
                warn!("device enumeration timed out");
                return;
            }
        };

        let present: BTreeSet<DeviceId> = listed.iter().map(|d| d.id).collect();
        let known: Vec<DeviceId> = self.devices.read().keys().copied().collect();

        for id in known.into_iter().filter(|id| !present.contains(id)) {
            // Already gone if a concurrent deregister won the race
            let _ = self.deregister(id, RemovalReason::Vanished);
        }
        for info in listed {
            if !self.devices.read().contains_key(&info.id) {
                let _ = self.register(info);
            }
        }
    }

    async fn run_cycle(self: &Arc<Self>) -> CycleSummary {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        if cycle % u64::from(self.config.rescan_every) == 0 {
            self.rescan().await;
        }

        let slots: Vec<Arc<DeviceSlot>> = self.devices.read().values().cloned().collect();
        let mut tasks = JoinSet::new();
        for slot in slots {
            let shared = Arc::clone(self);
            tasks.spawn(async move {
                let id = slot.info.id;
                (id, shared.sample_device(slot).await)
            });
        }

        let mut summary = CycleSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, CycleOutcome::Published(_))) => summary.published += 1,
                Ok((_, CycleOutcome::Stale(_))) => summary.stale += 1,
                Ok((_, CycleOutcome::Rejected)) => summary.rejected += 1,
                Ok((id, CycleOutcome::Removed)) => {
                    summary.removed += 1;
                    debug!(device = %id, "removed after permanent failure");
                }
                // A panicking device task must not take the others down
                Err(e) => warn!(error = %e, "device task failed"),
            }
        }
        summary
    }

    async fn sample_device(&self, slot: Arc<DeviceSlot>) -> CycleOutcome {
        let id = slot.info.id;
        // A timed-out call keeps its blocking thread; never stack another
        // one on top of it
        let Some(guard) = InFlight::acquire(&slot.sampling) else {
            debug!(device = %id, "previous sample still outstanding");
            return self.mark_stale(&slot, "previous sample still outstanding".to_string());
        };

        let source = Arc::clone(&self.source);
        let timeout = self.config.sample_timeout();

        let sampled = match tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                source.sample(id)
            }),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SourceError::Transient(format!("sampler task failed: {}", e))),
            Err(_) => Err(SourceError::Transient(format!(
                "sample timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match sampled {
            Ok(snapshot) => self.commit(&slot, snapshot),
            Err(SourceError::Transient(message)) => {
                warn!(device = %id, error = %message, "transient sample failure");
                self.mark_stale(&slot, message)
            }
            Err(SourceError::Permanent(message)) => {
                warn!(device = %id, error = %message, "device failed permanently");
                let _ = self.deregister(id, RemovalReason::Failed);
                CycleOutcome::Removed
            }
        }
    }

    /// Push, observe, classify and publish as one step under the device
    /// lock
    fn commit(&self, slot: &Arc<DeviceSlot>, snapshot: Snapshot) -> CycleOutcome {
        let id = slot.info.id;
        let mut state = slot.state.lock();

        let timestamp = snapshot.timestamp;
        let observed = snapshot.clone();
        if let Err(e) = state.buffer.push(snapshot) {
            warn!(device = %id, error = %e, "rejected snapshot");
            return CycleOutcome::Rejected;
        }
        state.peaks.observe_snapshot(&observed);

        let window = state.buffer.window();
        let peaks = state.peaks.snapshot();
        let verdict = self.classifier.classify_with_peaks(id, &window, &peaks);
        debug!(device = %id, label = %verdict.label, confidence = verdict.confidence, "classified");

        let report = Arc::new(DeviceReport {
            device: slot.info.clone(),
            window,
            verdict,
            peaks,
            last_success: timestamp,
            stale: None,
        });
        self.publish(slot, &report);
        CycleOutcome::Published(report)
    }

    fn mark_stale(&self, slot: &Arc<DeviceSlot>, message: String) -> CycleOutcome {
        let _state = slot.state.lock();
        let previous = slot.published.read().clone();
        let Some(previous) = previous else {
            return CycleOutcome::Stale(None);
        };

        let report = Arc::new(previous.mark_stale(Utc::now(), message));
        self.publish(slot, &report);
        CycleOutcome::Stale(Some(report))
    }

    fn publish(&self, slot: &Arc<DeviceSlot>, report: &Arc<DeviceReport>) {
        *slot.published.write() = Some(Arc::clone(report));
        if self.is_current(slot) {
            self.hub.publish(DeviceEvent::Report(Arc::clone(report)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Label;
    use crate::monitor::synthetic::{Profile, SyntheticSource};
    use chrono::DateTime;
    use crossbeam::channel::{self, Sender};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn config() -> Config {
        Config {
            window_size: 5,
            interval_ms: 20,
            sample_timeout_ms: 500,
            ..Default::default()
        }
    }

    /// One device whose chosen calls hang for `stall` before answering
    struct StallingSource {
        stall: Duration,
        stalling_calls: BTreeSet<u32>,
        calls: Mutex<u32>,
        outstanding: AtomicUsize,
        max_outstanding: AtomicUsize,
        started: Sender<u32>,
    }

    impl StallingSource {
        fn new(stall: Duration, stalling_calls: &[u32]) -> (Arc<Self>, Receiver<u32>) {
            let (started, rx) = channel::unbounded();
            let source = Self {
                stall,
                stalling_calls: stalling_calls.iter().copied().collect(),
                calls: Mutex::new(0),
                outstanding: AtomicUsize::new(0),
                max_outstanding: AtomicUsize::new(0),
                started,
            };
            (Arc::new(source), rx)
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    impl MetricSource for StallingSource {
        fn devices(&self) -> std::result::Result<Vec<DeviceInfo>, SourceError> {
            Ok(vec![DeviceInfo::new(DeviceId(0), "stalling")])
        }

        fn sample(&self, _device: DeviceId) -> std::result::Result<Snapshot, SourceError> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_outstanding.fetch_max(now, Ordering::SeqCst);
            let _ = self.started.send(call);

            if self.stalling_calls.contains(&call) {
                std::thread::sleep(self.stall);
            }
            self.outstanding.fetch_sub(1, Ordering::SeqCst);

            let ts = DateTime::from_timestamp(1_700_000_000 + i64::from(call), 0).unwrap();
            Ok(Snapshot::empty(ts).with(Metric::GpuUtil, 50.0))
        }
    }

    fn aggregator(profiles: &[Profile]) -> (Arc<SyntheticSource>, Aggregator) {
        let source = Arc::new(SyntheticSource::new(11, profiles));
        let agg = Aggregator::new(source.clone(), config());
        (source, agg)
    }

    #[tokio::test]
    async fn test_first_cycle_registers_and_publishes() {
        let (_, agg) = aggregator(&[Profile::Compute, Profile::Memory]);
        let events = agg.subscribe();

        let summary = agg.run_cycle().await;
        assert_eq!(summary.published, 2);
        assert_eq!(agg.device_ids(), vec![DeviceId(0), DeviceId(1)]);

        let added = events
            .try_iter()
            .filter(|e| matches!(e, DeviceEvent::Added(_)))
            .count();
        assert_eq!(added, 2);

        // One sample is not enough to judge
        let report = agg.latest(DeviceId(0)).unwrap();
        assert_eq!(report.verdict.label, Label::Unknown);
        assert_eq!(report.window.len(), 1);
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_verdicts_settle() {
        let (_, agg) = aggregator(&[Profile::Memory]);
        for _ in 0..8 {
            agg.run_cycle().await;
        }
        let report = agg.latest(DeviceId(0)).unwrap();
        assert_eq!(report.window.len(), 5);
        assert_eq!(report.verdict.label, Label::MemoryBound);
        assert_eq!(report.verdict.timestamp, Some(report.last_success));
    }

    #[tokio::test]
    async fn test_transient_failure_marks_stale_and_keeps_state() {
        let (source, agg) = aggregator(&[Profile::Compute]);
        for _ in 0..3 {
            agg.run_cycle().await;
        }
        let before = agg.latest(DeviceId(0)).unwrap();

        source.fail_transient(DeviceId(0), 2);
        let summary = agg.run_cycle().await;
        assert_eq!(summary.stale, 1);
        agg.run_cycle().await;

        let stale = agg.latest(DeviceId(0)).unwrap();
        let info = stale.stale.as_ref().unwrap();
        assert_eq!(info.consecutive_failures, 2);
        assert_eq!(stale.last_success, before.last_success);
        assert_eq!(stale.window.len(), before.window.len());

        agg.run_cycle().await;
        let fresh = agg.latest(DeviceId(0)).unwrap();
        assert!(!fresh.is_stale());
        assert_eq!(fresh.window.len(), before.window.len() + 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_removes_only_that_device() {
        let (source, agg) = aggregator(&[Profile::Compute, Profile::Idle]);
        let events = agg.subscribe();
        agg.run_cycle().await;

        source.remove(DeviceId(1));
        let summary = agg.run_cycle().await;
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.published, 1);
        assert_eq!(agg.device_ids(), vec![DeviceId(0)]);
        assert!(agg.latest(DeviceId(1)).is_none());

        let removed: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                DeviceEvent::Removed { id, reason } => Some((id, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![(DeviceId(1), RemovalReason::Failed)]);
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (_, agg) = aggregator(&[]);
        agg.register(DeviceInfo::new(DeviceId(3), "manual")).unwrap();
        assert_eq!(
            agg.register(DeviceInfo::new(DeviceId(3), "again")),
            Err(SonarError::AlreadyRegistered(DeviceId(3)))
        );
        agg.deregister(DeviceId(3)).unwrap();
        assert_eq!(
            agg.deregister(DeviceId(3)),
            Err(SonarError::UnknownDevice(DeviceId(3)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_driver_publishes_until_stopped() {
        let (_, mut agg) = aggregator(&[Profile::Idle]);
        let events = agg.subscribe();
        agg.start();

        let mut reports = 0;
        while reports < 3 {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(DeviceEvent::Report(_)) => reports += 1,
                Ok(_) => {}
                Err(e) => panic!("no report from driver: {}", e),
            }
        }

        agg.stop().await;
        // Drain whatever was in flight, then nothing more arrives
        while events.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hung_sample_is_not_stacked() {
        let (source, _started) = StallingSource::new(Duration::from_millis(400), &[1]);
        let agg = Aggregator::new(
            source.clone(),
            Config {
                sample_timeout_ms: 30,
                ..config()
            },
        );

        for _ in 0..6 {
            let summary = agg.run_cycle().await;
            assert_eq!(summary.stale, 1);
        }
        assert_eq!(source.calls(), 1);
        assert_eq!(source.max_outstanding.load(Ordering::SeqCst), 1);

        // Once the hung call returns the device is sampled again
        tokio::time::sleep(Duration::from_millis(600)).await;
        let summary = agg.run_cycle().await;
        assert_eq!(summary.published, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_abandons_in_flight_cycle() {
        let (source, started) = StallingSource::new(Duration::from_millis(500), &[2]);
        let mut agg = Aggregator::new(
            source,
            Config {
                sample_timeout_ms: 5_000,
                shutdown_timeout_ms: 250,
                ..config()
            },
        );
        let events = agg.subscribe();
        agg.start();

        // The first call answers, the second hangs inside a cycle
        assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        let before = agg.latest(DeviceId(0)).unwrap();

        let began = Instant::now();
        agg.stop().await;
        assert!(began.elapsed() < agg.config().shutdown_timeout());

        // Let the hung call finish; its snapshot must never land
        tokio::time::sleep(Duration::from_millis(700)).await;
        let after = agg.latest(DeviceId(0)).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.window.len(), 1);
        assert!(events
            .try_iter()
            .all(|e| !matches!(e, DeviceEvent::Report(r) if r.window.len() > 1)));
    }
}
