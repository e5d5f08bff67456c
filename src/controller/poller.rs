use chrono::Local;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::diff::{ButtonDelta, ChangeRecord};
use super::settle::SettleDetector;
use super::source::{DeviceError, SnapshotSource};
use crate::bus::EventBus;

// Poller settings
#[derive(Clone, Debug, PartialEq)]
pub struct PollerSettings {
    pub device_index: usize,
    pub poll_interval: Duration,
    pub settle_duration: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            poll_interval: Duration::from_millis(1),
            settle_duration: Duration::from_millis(10),
        }
    }
}

// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Failed to spawn poller worker: {0}")]
    SpawnError(String),

    #[error("Failed to build poller runtime: {0}")]
    RuntimeError(String),

    #[error("Failed to open snapshot source: {0}")]
    SourceError(#[from] DeviceError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    ReadFailed,
    Unchanged,
    Accepted { buttons: Option<ButtonDelta> },
}

#[derive(Debug)]
struct PollStats {
    reads: u64,
    failures: u64,
    accepted: u64,
    last_log_time: chrono::DateTime<Local>,
}

impl PollStats {
    const LOG_INTERVAL_SECS: i64 = 30;

    fn new() -> Self {
        Self {
            reads: 0,
            failures: 0,
            accepted: 0,
            last_log_time: Local::now(),
        }
    }

    fn maybe_log(&mut self) {
        let now = Local::now();
        let elapsed = now - self.last_log_time;
        if elapsed < chrono::Duration::seconds(Self::LOG_INTERVAL_SECS) {
            return;
        }
        info!(
            "Poller stats: {} reads, {} failed reads, {} accepted transitions in last {} seconds",
            self.reads,
            self.failures,
            self.accepted,
            elapsed.num_seconds()
        );
        if self.reads == 0 && self.failures > 0 {
            warn!("Joypad unreachable for the last {} seconds", elapsed.num_seconds());
        }
        *self = Self::new();
    }
}

/// Sample → debounce → diff → publish, one reading per call to
/// [`Poller::poll_once`].
pub struct Poller<S: SnapshotSource> {
    source: S,
    settings: PollerSettings,
    detector: SettleDetector,
    bus: Arc<EventBus>,
    stats: PollStats,
}

impl<S: SnapshotSource> Poller<S> {
    pub fn new(source: S, settings: PollerSettings, bus: Arc<EventBus>) -> Self {
        Self::starting_at(source, settings, bus, Instant::now())
    }

    pub fn starting_at(
        source: S,
        settings: PollerSettings,
        bus: Arc<EventBus>,
        start: Instant,
    ) -> Self {
        let detector = SettleDetector::starting_at(settings.settle_duration, start);
        Self {
            source,
            settings,
            detector,
            bus,
            stats: PollStats::new(),
        }
    }

    /// Reads one snapshot taken at `now` and publishes it if it settled.
    ///
    /// Read failures are swallowed; the caller simply polls again.
    pub fn poll_once(&mut self, now: Instant) -> PollOutcome {
        let snapshot = match self.source.read(self.settings.device_index) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.failures += 1;
                if e.is_transient() {
                    trace!("Joypad read failed: {}", e);
                } else {
                    debug!("Joypad read failed: {}", e);
                }
                return PollOutcome::ReadFailed;
            }
        };
        self.stats.reads += 1;

        let Some((old, new)) = self.detector.observe(snapshot, now) else {
            return PollOutcome::Unchanged;
        };
        self.stats.accepted += 1;

        let record = ChangeRecord::new(old, new);
        info!(
            "State changed at {}: {}",
            record.accepted_at.format("%H:%M:%S.%3f"),
            record.diff
        );
        // the transition is final here; subscriber faults are contained by the bus
        let buttons = self.bus.publish_transition(record);
        PollOutcome::Accepted { buttons }
    }

    /// Polls until `cancel` fires. Cancellation is observed before each read
    /// and during the sleep between reads, never in the middle of one.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Starting poller loop for joypad {} ({:?} interval, {:?} settle)",
            self.settings.device_index,
            self.settings.poll_interval,
            self.detector.settle_duration()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.poll_once(Instant::now());
            self.stats.maybe_log();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Poller loop for joypad {} stopped", self.settings.device_index);
    }
}

/// Owns the dedicated poller thread.
///
/// The snapshot source is built on the worker itself, so sources that are not
/// `Send` (gilrs on some platforms) can be used.
pub struct PollerHandle {
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl PollerHandle {
    pub fn spawn<S, F>(
        settings: PollerSettings,
        bus: Arc<EventBus>,
        make_source: F,
    ) -> Result<Self, PollerError>
    where
        S: SnapshotSource + 'static,
        F: FnOnce() -> Result<S, DeviceError> + Send + 'static,
    {
        info!("Spawning poller worker with settings: {:?}", settings);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| PollerError::RuntimeError(e.to_string()))?;

        let thread = thread::Builder::new()
            .name("joypad-poller".to_string())
            .spawn(move || {
                let source = match make_source() {
                    Ok(source) => source,
                    Err(e) => {
                        error!("Failed to open snapshot source: {}", e);
                        return;
                    }
                };
                let poller = Poller::new(source, settings, bus);
                runtime.block_on(poller.run(worker_cancel));
            })
            .map_err(|e| PollerError::SpawnError(e.to_string()))?;

        debug!("Poller thread spawned: {:?}", thread.thread().id());
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    /// Asks the worker to stop at its next suspension point. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Cancels and waits up to `timeout` for the worker to exit.
    ///
    /// A worker stuck inside a source read is detached instead; it exits on
    /// its own once the read returns. Returns false in that case.
    pub fn join(mut self, timeout: Duration) -> bool {
        self.cancel();
        let Some(worker) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!("Poller thread did not stop within {:?}, detaching it", timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if worker.join().is_err() {
            error!("Poller thread panicked");
        }
        true
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::controller::snapshot::{Axes, Snapshot};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Replays scripted readings, one per call; the last one repeats
    struct ScriptedSource {
        readings: VecDeque<Result<Snapshot, DeviceError>>,
        last: Option<Snapshot>,
    }

    impl ScriptedSource {
        fn new(readings: Vec<Result<Snapshot, DeviceError>>) -> Self {
            Self {
                readings: readings.into(),
                last: None,
            }
        }
    }

    impl SnapshotSource for ScriptedSource {
        fn read(&mut self, device_index: usize) -> Result<Snapshot, DeviceError> {
            match self.readings.pop_front() {
                Some(Ok(snapshot)) => {
                    self.last = Some(snapshot.clone());
                    Ok(snapshot)
                }
                Some(Err(e)) => Err(e),
                None => self.last.clone().ok_or(DeviceError::NotConnected(device_index)),
            }
        }
    }

    fn buttons(pressed: &[bool]) -> Snapshot {
        Snapshot::new(Axes::default(), pressed.to_vec())
    }

    fn hold(snapshot: &Snapshot, reads: usize) -> Vec<Result<Snapshot, DeviceError>> {
        (0..reads).map(|_| Ok(snapshot.clone())).collect()
    }

    fn collect_records(bus: &EventBus) -> Arc<Mutex<Vec<ChangeRecord>>> {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        bus.subscribe(Topic::StateChanged, "test/records", move |event| {
            sink.lock().unwrap().push(event.record().clone());
            Ok(())
        });
        records
    }

    // One read per millisecond of virtual time
    fn drive<S: SnapshotSource>(poller: &mut Poller<S>, start: Instant, reads: u64) -> Vec<PollOutcome> {
        (1..=reads)
            .map(|t| poller.poll_once(start + Duration::from_millis(t)))
            .collect()
    }

    #[test]
    fn records_form_a_chain() {
        let idle = buttons(&[false, false]);
        let a = buttons(&[true, false]);
        let b = buttons(&[true, true]);
        let mut script = hold(&idle, 20);
        script.extend(hold(&a, 20));
        script.extend(hold(&b, 20));
        script.extend(hold(&idle, 20));

        let bus = Arc::new(EventBus::new());
        let records = collect_records(&bus);
        let start = Instant::now();
        let mut poller = Poller::starting_at(
            ScriptedSource::new(script),
            PollerSettings::default(),
            bus,
            start,
        );
        drive(&mut poller, start, 80);

        let records = records.lock().unwrap();
        let states: Vec<&Snapshot> = records.iter().map(|r| &r.new).collect();
        assert_eq!(states, vec![&idle, &a, &b, &idle]);
        assert_eq!(records[0].old, Snapshot::empty());
        for pair in records.windows(2) {
            assert_eq!(pair[1].old, pair[0].new);
        }
    }

    #[test]
    fn read_failures_are_skipped() {
        let idle = buttons(&[false]);
        let pressed = buttons(&[true]);
        let mut script = hold(&idle, 15);
        script.push(Err(DeviceError::NotConnected(0)));
        script.extend(hold(&pressed, 5));
        script.push(Err(DeviceError::ReadError("short read".into())));
        script.extend(hold(&pressed, 15));

        let bus = Arc::new(EventBus::new());
        let start = Instant::now();
        let mut poller = Poller::starting_at(
            ScriptedSource::new(script),
            PollerSettings::default(),
            bus,
            start,
        );
        let outcomes = drive(&mut poller, start, 37);

        assert_eq!(
            outcomes.iter().filter(|o| **o == PollOutcome::ReadFailed).count(),
            2
        );
        let accepted: Vec<&PollOutcome> = outcomes
            .iter()
            .filter(|o| matches!(o, PollOutcome::Accepted { .. }))
            .collect();
        assert_eq!(accepted.len(), 2);
        assert_eq!(
            accepted[1],
            &PollOutcome::Accepted {
                buttons: Some(ButtonDelta::from_iter([(0, true)]))
            }
        );
    }

    #[test]
    fn failing_subscriber_does_not_undo_transition() {
        let idle = buttons(&[false]);
        let pressed = buttons(&[true]);
        let mut script = hold(&idle, 20);
        script.extend(hold(&pressed, 20));

        let bus = Arc::new(EventBus::new());
        bus.subscribe(Topic::ButtonsChanged, "test/broken", |_| {
            Err(color_eyre::eyre::eyre!("consumer fault"))
        });
        let records = collect_records(&bus);
        let start = Instant::now();
        let mut poller = Poller::starting_at(
            ScriptedSource::new(script),
            PollerSettings::default(),
            bus,
            start,
        );
        drive(&mut poller, start, 40);

        assert_eq!(poller.detector.last_stable(), &pressed);
        assert_eq!(records.lock().unwrap().len(), 2);
    }

    // Blocks inside every read
    struct StuckSource(Duration);

    impl SnapshotSource for StuckSource {
        fn read(&mut self, _device_index: usize) -> Result<Snapshot, DeviceError> {
            thread::sleep(self.0);
            Ok(Snapshot::empty())
        }
    }

    #[test]
    fn join_gives_up_on_stuck_worker() {
        let bus = Arc::new(EventBus::new());
        let handle = PollerHandle::spawn(PollerSettings::default(), bus.clone(), || {
            Ok(StuckSource(Duration::from_secs(2)))
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(!handle.join(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let quick = PollerHandle::spawn(PollerSettings::default(), bus, || {
            Ok(ScriptedSource::new(vec![Err(DeviceError::NotConnected(0))]))
        })
        .unwrap();
        assert!(quick.join(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let bus = Arc::new(EventBus::new());
        let poller = Poller::new(
            ScriptedSource::new(vec![Err(DeviceError::NotConnected(0))]),
            PollerSettings::default(),
            bus,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller observes cancellation")
            .unwrap();
    }
}
