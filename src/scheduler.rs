use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Credentials, PollSettings, ScheduleSettings};
use crate::error::PollResult;
use crate::extract::{MetricExtractor, Reading};
use crate::inventory::{Device, DeviceId};
use crate::series::{Sample, TimeSeries};
use crate::session::prompt::run_round_trip;
use crate::session::{ShellSession, ShellTransport};
use crate::sink::SeriesSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Polling,
    /// Backing off after repeated failures; skips this many more sweeps.
    Cooldown { remaining_sweeps: u32 },
}

#[derive(Debug, Default)]
struct WorkerSlot {
    state: WorkerState,
    consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug)]
struct PollOutcome {
    device_id: DeviceId,
    sample: Sample,
}

/// Opens a session, runs the prompt round-trip and extracts the reading.
/// The session is closed before returning on every path.
pub fn fetch_reading<T>(
    transport: &T,
    extractor: &dyn MetricExtractor,
    device: &Device,
    credentials: &Credentials,
    settings: &PollSettings,
) -> PollResult<Reading>
where
    T: ShellTransport + ?Sized,
{
    let mut session = transport.open(&device.address, credentials, settings.connect_timeout)?;
    let output = run_round_trip(&mut session, settings);
    session.close();
    Ok(extractor.extract(&output?))
}

/// One poll attempt for one device. Never fails: errors become failure samples.
pub fn poll_one<T>(
    transport: &T,
    extractor: &dyn MetricExtractor,
    device: &Device,
    credentials: &Credentials,
    settings: &PollSettings,
    clock: &dyn Clock,
) -> Sample
where
    T: ShellTransport + ?Sized,
{
    match fetch_reading(transport, extractor, device, credentials, settings) {
        Ok(reading) => Sample::reading(clock.now(), reading),
        Err(err) => Sample::failure(clock.now(), err),
    }
}

/// Sweeps the fleet forever. Owns every device's history; publishes a
/// snapshot to the sink after each append.
pub struct Scheduler<T: ShellTransport> {
    devices: Vec<Device>,
    transport: Arc<T>,
    extractor: Arc<dyn MetricExtractor>,
    credentials: Arc<Credentials>,
    poll: Arc<PollSettings>,
    schedule: ScheduleSettings,
    clock: Arc<dyn Clock>,
    sink: SeriesSink,
    series: BTreeMap<DeviceId, TimeSeries>,
    workers: BTreeMap<DeviceId, WorkerSlot>,
}

impl<T: ShellTransport> Scheduler<T> {
    pub fn new(
        devices: Vec<Device>,
        transport: Arc<T>,
        extractor: Arc<dyn MetricExtractor>,
        credentials: Credentials,
        poll: PollSettings,
        schedule: ScheduleSettings,
    ) -> Self {
        let sink = SeriesSink::new(&devices);
        let series = devices
            .iter()
            .map(|device| (device.id, TimeSeries::new(schedule.retention)))
            .collect();
        let workers = devices
            .iter()
            .map(|device| (device.id, WorkerSlot::default()))
            .collect();
        Self {
            devices,
            transport,
            extractor,
            credentials: Arc::new(credentials),
            poll: Arc::new(poll),
            schedule,
            clock: Arc::new(SystemClock),
            sink,
            series,
            workers,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(&self) -> SeriesSink {
        self.sink.clone()
    }

    pub fn series(&self, id: DeviceId) -> Option<&TimeSeries> {
        self.series.get(&id)
    }

    pub fn worker_state(&self, id: DeviceId) -> Option<WorkerState> {
        self.workers.get(&id).map(|slot| slot.state)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            devices = self.devices.len(),
            interval_secs = self.schedule.sweep_interval.as_secs(),
            "poll scheduler started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.sweep() => {
                    let report = report?;
                    debug!(
                        polled = report.polled,
                        failed = report.failed,
                        skipped = report.skipped,
                        "sweep complete"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.schedule.sweep_interval) => {}
            }
        }
        info!("poll scheduler stopped");
        Ok(())
    }

    /// Polls every device that is not cooling down, at most
    /// `max_concurrency` at a time, and records each result as it arrives.
    pub async fn sweep(&mut self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let (tx, mut rx) = mpsc::channel::<PollOutcome>(self.devices.len().max(1));
        let permits = Arc::new(Semaphore::new(self.schedule.max_concurrency.max(1)));

        for device in &self.devices {
            let slot = self.workers.entry(device.id).or_default();
            if let WorkerState::Cooldown { remaining_sweeps } = slot.state {
                slot.state = match remaining_sweeps.saturating_sub(1) {
                    0 => WorkerState::Idle,
                    remaining_sweeps => WorkerState::Cooldown { remaining_sweeps },
                };
                debug!(device_id = device.id, "device cooling down; skipping sweep");
                report.skipped += 1;
                continue;
            }
            slot.state = WorkerState::Polling;

            let device = device.clone();
            let transport = self.transport.clone();
            let extractor = self.extractor.clone();
            let credentials = self.credentials.clone();
            let settings = self.poll.clone();
            let clock = self.clock.clone();
            let permits = permits.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                let device_id = device.id;
                let span = tracing::info_span!("poll", device_id, address = %device.address);
                let worker_clock = clock.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let _entered = span.enter();
                    poll_one(
                        transport.as_ref(),
                        extractor.as_ref(),
                        &device,
                        &credentials,
                        &settings,
                        worker_clock.as_ref(),
                    )
                })
                .await;
                let sample = match result {
                    Ok(sample) => sample,
                    Err(err) => {
                        error!(device_id, error = %err, "poll task failed");
                        Sample::failure(clock.now(), format!("poll task failed: {err}"))
                    }
                };
                // The receiver only goes away when the sweep was cancelled.
                tx.send(PollOutcome { device_id, sample }).await.ok();
            });
            report.polled += 1;
        }
        drop(tx);

        let mut received = 0;
        while let Some(outcome) = rx.recv().await {
            received += 1;
            if outcome.sample.is_failure() {
                report.failed += 1;
            }
            self.record(outcome);
        }
        if received != report.polled {
            bail!(
                "sweep lost {} of {} poll results",
                report.polled - received,
                report.polled
            );
        }
        Ok(report)
    }

    fn record(&mut self, outcome: PollOutcome) {
        let PollOutcome { device_id, sample } = outcome;
        let backoff_cap = self.schedule.failure_backoff_max_sweeps;

        if let Some(slot) = self.workers.get_mut(&device_id) {
            if let Some(message) = sample.error.as_deref() {
                slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
                let skip = cooldown_sweeps(slot.consecutive_failures, backoff_cap);
                warn!(
                    device_id,
                    error = %message,
                    consecutive_failures = slot.consecutive_failures,
                    cooldown_sweeps = skip,
                    "device poll failed"
                );
                slot.state = if skip > 0 {
                    WorkerState::Cooldown {
                        remaining_sweeps: skip,
                    }
                } else {
                    WorkerState::Idle
                };
            } else {
                debug!(
                    device_id,
                    air_temp = ?sample.air_temp,
                    liquid_temp = ?sample.liquid_temp,
                    "device polled"
                );
                slot.consecutive_failures = 0;
                slot.state = WorkerState::Idle;
            }
        }

        let Some(series) = self.series.get_mut(&device_id) else {
            warn!(device_id, "result for unknown device dropped");
            return;
        };
        series.append(sample);
        self.sink.publish(device_id, series.snapshot());
    }
}

/// Sweeps to skip after `failures` consecutive failures: 0, 1, 3, 7, ...
/// capped at `cap`. A cap of 0 disables backoff.
fn cooldown_sweeps(failures: u32, cap: u32) -> u32 {
    if cap == 0 || failures <= 1 {
        return 0;
    }
    let exponent = (failures - 1).min(31);
    let skip = (1u64 << exponent) - 1;
    skip.min(u64::from(cap)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PollError;
    use crate::extract::LabelExtractor;
    use crate::session::ShellChannel;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Behavior {
        Respond(&'static str),
        Refuse,
        Panic,
    }

    struct FakeSession {
        pending: Vec<u8>,
        response: &'static str,
        closes: Arc<AtomicUsize>,
        closed: bool,
    }

    impl ShellChannel for FakeSession {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.pending.is_empty() {
                return Ok(None);
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(Some(n))
        }

        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            self.pending.extend_from_slice(self.response.as_bytes());
            Ok(())
        }
    }

    impl ShellSession for FakeSession {
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct FakeTransport {
        behaviors: HashMap<String, Behavior>,
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        fn new(behaviors: &[(&str, Behavior)]) -> Self {
            Self {
                behaviors: behaviors
                    .iter()
                    .map(|(addr, b)| (addr.to_string(), b.clone()))
                    .collect(),
                opens: AtomicUsize::new(0),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ShellTransport for FakeTransport {
        type Session = FakeSession;

        fn open(
            &self,
            address: &str,
            _credentials: &Credentials,
            _connect_timeout: Duration,
        ) -> PollResult<FakeSession> {
            match self.behaviors.get(address) {
                Some(&Behavior::Respond(response)) => {
                    self.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeSession {
                        pending: b"CDU shell\r\nRScmCli# ".to_vec(),
                        response,
                        closes: self.closes.clone(),
                        closed: false,
                    })
                }
                Some(&Behavior::Panic) => panic!("transport bug"),
                Some(&Behavior::Refuse) | None => {
                    Err(PollError::Connection("connection refused".to_string()))
                }
            }
        }
    }

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().expect("clock lock");
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().expect("clock lock")
        }
    }

    fn device(id: DeviceId, address: &str) -> Device {
        Device {
            id,
            address: address.to_string(),
        }
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            prompt_timeout: Duration::from_millis(300),
            prompt_poll_interval: Duration::from_millis(1),
            ..PollSettings::default()
        }
    }

    fn scheduler(
        devices: Vec<Device>,
        transport: Arc<FakeTransport>,
        schedule: ScheduleSettings,
    ) -> Scheduler<FakeTransport> {
        Scheduler::new(
            devices,
            transport,
            Arc::new(LabelExtractor::cdu_default().expect("labels")),
            Credentials::new("admin", "secret"),
            fast_poll(),
            schedule,
        )
    }

    const GOOD: &str = "Temp Air Cold Average: 18.5\r\nTemp Liquid Supply: 22.0\r\nRScmCli# ";

    #[test]
    fn poll_one_closes_the_session_on_timeout() {
        let transport = FakeTransport::new(&[("silent", Behavior::Respond(""))]);
        let extractor = LabelExtractor::cdu_default().expect("labels");
        let sample = poll_one(
            &transport,
            &extractor,
            &device(1, "silent"),
            &Credentials::new("admin", "secret"),
            &fast_poll(),
            &SystemClock,
        );
        assert!(sample.error.as_deref().unwrap_or("").contains("RScmCli#"));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_refusal_does_not_stop_the_sweep() -> Result<()> {
        let transport = Arc::new(FakeTransport::new(&[
            ("a", Behavior::Respond(GOOD)),
            ("b", Behavior::Refuse),
            ("c", Behavior::Respond(GOOD)),
        ]));
        let mut scheduler = scheduler(
            vec![device(1, "a"), device(2, "b"), device(3, "c")],
            transport.clone(),
            ScheduleSettings::default(),
        );

        let report = scheduler.sweep().await?;
        assert_eq!(
            report,
            SweepReport {
                polled: 3,
                failed: 1,
                skipped: 0
            }
        );
        for id in [1, 3] {
            let latest = scheduler.series(id).and_then(|s| s.latest()).expect("sample");
            assert_eq!(latest.air_temp, Some(18.5));
            assert_eq!(latest.liquid_temp, Some(22.0));
        }
        let failed = scheduler.series(2).and_then(|s| s.latest()).expect("sample");
        assert!(failed.error.as_deref().unwrap_or("").contains("refused"));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.worker_state(2), Some(WorkerState::Idle));
        Ok(())
    }

    #[tokio::test]
    async fn panicking_worker_is_recorded_as_failure() -> Result<()> {
        let transport = Arc::new(FakeTransport::new(&[
            ("boom", Behavior::Panic),
            ("ok", Behavior::Respond(GOOD)),
        ]));
        let mut scheduler = scheduler(
            vec![device(1, "boom"), device(2, "ok")],
            transport,
            ScheduleSettings::default(),
        );
        let report = scheduler.sweep().await?;
        assert_eq!(report.failed, 1);
        let failed = scheduler.series(1).and_then(|s| s.latest()).expect("sample");
        assert!(failed.error.as_deref().unwrap_or("").contains("poll task failed"));
        assert!(scheduler
            .series(2)
            .and_then(|s| s.latest())
            .is_some_and(|s| !s.is_failure()));
        Ok(())
    }

    #[tokio::test]
    async fn sweeps_publish_to_the_sink() -> Result<()> {
        let transport = Arc::new(FakeTransport::new(&[("a", Behavior::Respond(GOOD))]));
        let mut scheduler = scheduler(vec![device(7, "a")], transport, ScheduleSettings::default());
        let sink = scheduler.sink();
        scheduler.sweep().await?;
        scheduler.sweep().await?;
        let view = sink.view(7).expect("view");
        assert_eq!(view.samples.len(), 2);
        assert_eq!(view.samples.len(), scheduler.series(7).map(|s| s.len()).unwrap_or(0));
        Ok(())
    }

    #[tokio::test]
    async fn history_stabilizes_under_a_synthetic_clock() -> Result<()> {
        let start = Utc::now();
        let clock = Arc::new(ManualClock(Mutex::new(start)));
        let transport = Arc::new(FakeTransport::new(&[("a", Behavior::Respond(GOOD))]));
        let mut scheduler = scheduler(vec![device(1, "a")], transport, ScheduleSettings::default())
            .with_clock(clock.clone());

        let mut lengths = Vec::new();
        for _ in 0..100 {
            scheduler.sweep().await?;
            lengths.push(scheduler.series(1).map(|s| s.len()).unwrap_or(0));
            clock.advance(chrono::Duration::hours(1));
        }
        assert_eq!(lengths[0], 1);
        assert_eq!(lengths[23], 24);
        assert!(lengths[24..].iter().all(|len| *len == 24));
        let series = scheduler.series(1).expect("series");
        let newest = series.latest().map(|s| s.timestamp).expect("latest");
        assert!(series
            .samples()
            .all(|s| s.timestamp > newest - chrono::Duration::hours(24)));
        Ok(())
    }

    #[tokio::test]
    async fn backoff_skips_sweeps_after_repeated_failures() -> Result<()> {
        let transport = Arc::new(FakeTransport::new(&[("down", Behavior::Refuse)]));
        let schedule = ScheduleSettings {
            failure_backoff_max_sweeps: 2,
            ..ScheduleSettings::default()
        };
        let mut scheduler = scheduler(vec![device(1, "down")], transport, schedule);

        let mut polled = Vec::new();
        for _ in 0..8 {
            polled.push(scheduler.sweep().await?.polled);
        }
        // failures: 1 -> no skip, 2 -> skip 1, 3 -> skip 2 (capped), ...
        assert_eq!(polled, vec![1, 1, 0, 1, 0, 0, 1, 0]);
        assert_eq!(scheduler.series(1).map(|s| s.len()), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() -> Result<()> {
        let transport = Arc::new(FakeTransport::new(&[("a", Behavior::Respond(GOOD))]));
        let schedule = ScheduleSettings {
            sweep_interval: Duration::from_secs(3600),
            ..ScheduleSettings::default()
        };
        let scheduler = scheduler(vec![device(1, "a")], transport, schedule);
        let sink = scheduler.sink();
        let mut rx = sink.subscribe(1).expect("slot");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        rx.changed().await?;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(sink.view(1).map(|v| v.samples.len()), Some(1));
        Ok(())
    }

    #[test]
    fn cooldown_grows_exponentially_up_to_the_cap() {
        assert_eq!(cooldown_sweeps(1, 10), 0);
        assert_eq!(cooldown_sweeps(2, 10), 1);
        assert_eq!(cooldown_sweeps(3, 10), 3);
        assert_eq!(cooldown_sweeps(4, 10), 7);
        assert_eq!(cooldown_sweeps(5, 10), 10);
        assert_eq!(cooldown_sweeps(500, 10), 10);
        assert_eq!(cooldown_sweeps(9, 0), 0);
    }
}
