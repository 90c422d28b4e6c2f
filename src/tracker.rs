use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::aggregator::SessionLog;
use crate::config::RuntimeSettings;
use crate::foreground::{ForegroundInspector, Observation, SystemInspector};
use crate::writer::{PersistError, SnapshotWriter};

pub trait Clock: Send {
    /// Seconds since the Unix epoch.
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

pub trait Ticker: Send {
    /// Blocks until the next tick is due. Returns `false` once the loop
    /// should end.
    fn wait_next(&mut self) -> bool;
}

/// Fires every `interval` until the paired sender signals or is dropped.
pub struct IntervalTicker {
    interval: Duration,
    stop: Receiver<()>,
}

impl IntervalTicker {
    pub fn new(interval: Duration) -> (Self, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { interval, stop: rx }, tx)
    }
}

impl Ticker for IntervalTicker {
    fn wait_next(&mut self) -> bool {
        match self.stop.recv_timeout(self.interval) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Inspect, aggregate, and every `autosave_every_ticks` ticks detach and flush.
pub struct PollLoop {
    inspector: Box<dyn ForegroundInspector>,
    clock: Box<dyn Clock>,
    ticker: Box<dyn Ticker>,
    log: SessionLog,
    writer: SnapshotWriter,
    autosave_every_ticks: u64,
}

impl PollLoop {
    pub fn new(
        inspector: Box<dyn ForegroundInspector>,
        clock: Box<dyn Clock>,
        ticker: Box<dyn Ticker>,
        log: SessionLog,
        writer: SnapshotWriter,
        autosave_every_ticks: u64,
    ) -> Self {
        Self {
            inspector,
            clock,
            ticker,
            log,
            writer,
            autosave_every_ticks: autosave_every_ticks.max(1),
        }
    }

    pub fn run(mut self) {
        let mut ticks_since_save = 0u64;
        loop {
            self.tick_once();

            ticks_since_save += 1;
            if ticks_since_save >= self.autosave_every_ticks {
                ticks_since_save = 0;
                self.autosave();
            }

            if !self.ticker.wait_next() {
                break;
            }
        }
        debug!("poll loop stopped");
    }

    fn tick_once(&self) {
        let now = self.clock.now();
        let observation = match self.inspector.inspect() {
            Ok(observation) => observation,
            Err(err) => {
                warn!(error = %err, "foreground inspection failed");
                Observation::default()
            }
        };
        self.log
            .tick(now, &observation.title, &observation.executable_path);
    }

    fn autosave(&self) {
        let sessions = self.log.detach_all();
        match self.writer.flush(&sessions) {
            Ok(Some(path)) => info!(path = %path.display(), "auto-save complete"),
            Ok(None) => debug!("auto-save skipped, no sessions"),
            Err(err) => error!(
                error = %err,
                sessions = sessions.len(),
                "auto-save failed, detached sessions dropped"
            ),
        }
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The operations a control surface drives: start polling, save on demand,
/// and save once more on the way out.
pub struct Agent {
    log: SessionLog,
    writer: SnapshotWriter,
    settings: RuntimeSettings,
    worker: Mutex<Option<Worker>>,
}

impl Agent {
    pub fn new(log: SessionLog, writer: SnapshotWriter, settings: RuntimeSettings) -> Self {
        Self {
            log,
            writer,
            settings,
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.start_with(Box::new(SystemInspector::new()), Box::new(SystemClock))
    }

    pub fn start_with(
        &self,
        inspector: Box<dyn ForegroundInspector>,
        clock: Box<dyn Clock>,
    ) -> Result<()> {
        let mut worker = self.worker();
        if worker.is_some() {
            bail!("usage tracker is already running");
        }

        let (ticker, stop) = IntervalTicker::new(self.settings.poll_interval);
        let poll_loop = PollLoop::new(
            inspector,
            clock,
            Box::new(ticker),
            self.log.clone(),
            self.writer.clone(),
            self.settings.autosave_every_ticks,
        );
        let handle = thread::Builder::new()
            .name("usage-poller".to_string())
            .spawn(move || poll_loop.run())
            .context("failed to spawn usage polling thread")?;

        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            autosave_every_ticks = self.settings.autosave_every_ticks,
            output_dir = %self.writer.output_dir().display(),
            "usage tracking started"
        );
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker().is_some()
    }

    pub fn pending_sessions(&self) -> usize {
        self.log.pending()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.writer.output_dir().to_path_buf()
    }

    pub fn manual_save(&self) -> Result<Option<PathBuf>, PersistError> {
        self.detach_and_flush()
    }

    /// Stops the poller before the final detach so no tick lands after it.
    pub fn exit_save(&self) -> Result<Option<PathBuf>, PersistError> {
        let worker = self.worker().take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                warn!("usage polling thread panicked");
            }
        }
        self.detach_and_flush()
    }

    fn detach_and_flush(&self) -> Result<Option<PathBuf>, PersistError> {
        let sessions = self.log.detach_all();
        self.writer.flush(&sessions)
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{ContinuityPolicy, UsageSession};
    use crate::foreground::InspectionError;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    struct ScriptedInspector {
        script: Mutex<VecDeque<Result<Observation, InspectionError>>>,
        fallback: Observation,
    }

    impl ScriptedInspector {
        fn new(script: Vec<Result<Observation, InspectionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: Observation::default(),
            }
        }

        fn repeating(observation: Observation) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: observation,
            }
        }
    }

    impl ForegroundInspector for ScriptedInspector {
        fn inspect(&self) -> Result<Observation, InspectionError> {
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    /// 0, 10, 20, ...
    #[derive(Default)]
    struct StepClock(AtomicI64);

    impl Clock for StepClock {
        fn now(&self) -> i64 {
            self.0.fetch_add(10, Ordering::SeqCst)
        }
    }

    struct CountedTicker(usize);

    impl Ticker for CountedTicker {
        fn wait_next(&mut self) -> bool {
            if self.0 == 0 {
                return false;
            }
            self.0 -= 1;
            true
        }
    }

    fn observed(exe: &str) -> Result<Observation, InspectionError> {
        Ok(Observation::new(format!("{exe} window"), exe))
    }

    fn run_script(
        script: Vec<Result<Observation, InspectionError>>,
        writer: SnapshotWriter,
        autosave_every_ticks: u64,
    ) -> SessionLog {
        let ticks = script.len();
        let log = SessionLog::new(ContinuityPolicy::Preserve);
        PollLoop::new(
            Box::new(ScriptedInspector::new(script)),
            Box::new(StepClock::default()),
            Box::new(CountedTicker(ticks.saturating_sub(1))),
            log.clone(),
            writer,
            autosave_every_ticks,
        )
        .run();
        log
    }

    fn snapshot_files(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        files.sort();
        files
    }

    fn spans(sessions: &[UsageSession]) -> Vec<(&str, i64, i64)> {
        sessions
            .iter()
            .map(|s| (s.executable_path.as_str(), s.start, s.end))
            .collect()
    }

    #[test]
    fn loop_aggregates_one_session_per_tick_run() {
        let tmp = TempDir::new().expect("temp dir");
        let writer = SnapshotWriter::new(tmp.path().to_path_buf(), None);
        let log = run_script(
            vec![observed("A.exe"), observed("B.exe"), observed("B.exe")],
            writer,
            100,
        );

        let sessions = log.detach_all();
        assert_eq!(spans(&sessions), vec![("A.exe", 0, 10), ("B.exe", 10, 20)]);
        assert_eq!(sessions[1].title, "B.exe window");
        assert!(snapshot_files(tmp.path()).is_empty());
    }

    #[test]
    fn inspection_error_counts_as_nothing_focused() {
        let tmp = TempDir::new().expect("temp dir");
        let writer = SnapshotWriter::new(tmp.path().to_path_buf(), None);
        let log = run_script(
            vec![
                observed("A.exe"),
                Err(InspectionError::NoProcess),
                observed("A.exe"),
            ],
            writer,
            100,
        );

        assert_eq!(
            spans(&log.detach_all()),
            vec![("A.exe", 0, 10), ("A.exe", 20, 20)]
        );
    }

    #[test]
    fn autosave_flushes_every_nth_tick() {
        let tmp = TempDir::new().expect("temp dir");
        let writer = SnapshotWriter::new(tmp.path().to_path_buf(), None);
        let log = run_script(
            vec![
                observed("A.exe"),
                observed("A.exe"),
                observed("B.exe"),
                observed("B.exe"),
                observed("C.exe"),
            ],
            writer,
            2,
        );

        let files = snapshot_files(tmp.path());
        assert_eq!(files.len(), 2);

        let mut saved = Vec::new();
        for file in &files {
            let raw = fs::read_to_string(file).expect("read snapshot");
            let sessions: Vec<UsageSession> = serde_json::from_str(&raw).expect("parse snapshot");
            saved.extend(sessions);
        }
        assert_eq!(
            spans(&saved),
            vec![("A.exe", 0, 10), ("B.exe", 20, 30)]
        );
        assert_eq!(spans(&log.detach_all()), vec![("C.exe", 40, 40)]);
    }

    #[test]
    fn interval_ticker_stops_when_signalled() {
        let (mut ticker, stop) = IntervalTicker::new(Duration::from_secs(60));
        stop.send(()).expect("send stop");

        let started = Instant::now();
        assert!(!ticker.wait_next());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn interval_ticker_fires_on_timeout() {
        let (mut ticker, _stop) = IntervalTicker::new(Duration::from_millis(1));
        assert!(ticker.wait_next());
    }

    #[test]
    fn agent_manual_and_exit_save_hand_off_everything() {
        let tmp = TempDir::new().expect("temp dir");
        let agent = Agent::new(
            SessionLog::new(ContinuityPolicy::Preserve),
            SnapshotWriter::new(tmp.path().to_path_buf(), None),
            RuntimeSettings {
                poll_interval: Duration::from_millis(5),
                autosave_every_ticks: 1_000_000,
            },
        );

        agent
            .start_with(
                Box::new(ScriptedInspector::repeating(Observation::new("Editor", "code.exe"))),
                Box::new(StepClock::default()),
            )
            .expect("start");
        assert!(agent.is_running());
        assert!(agent.start().is_err());

        thread::sleep(Duration::from_millis(50));
        let manual = agent.manual_save().expect("manual save");
        assert!(manual.is_some());

        agent.exit_save().expect("exit save");
        assert!(!agent.is_running());
        assert_eq!(agent.pending_sessions(), 0);
        assert!(agent.exit_save().expect("second exit save").is_none());
    }

    #[test]
    fn manual_save_with_nothing_tracked_writes_nothing() {
        let tmp = TempDir::new().expect("temp dir");
        let agent = Agent::new(
            SessionLog::default(),
            SnapshotWriter::new(tmp.path().to_path_buf(), None),
            RuntimeSettings {
                poll_interval: Duration::from_secs(10),
                autosave_every_ticks: 60,
            },
        );

        assert!(agent.manual_save().expect("manual save").is_none());
        assert!(snapshot_files(tmp.path()).is_empty());
    }
}
