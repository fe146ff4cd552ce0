//! Periodic progress polling against the agent.
//!
//! A [`Poller`] owns one worker thread. Every `poll_interval` the worker
//! takes a registry snapshot, asks the agent about each tracked name on its
//! own scoped thread, and folds the answers back into the registry. Finished
//! torrents are removed and announced once. Each upload runs on a thread of
//! its own so a slow agent never holds up the ticks or the UI.

use std::{
    ffi::OsStr,
    fs,
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::{
    agent::{Agent, AgentResult},
    model::{completion_message, TorrentStatus, TORRENT_EXTENSION},
    registry::{AddOutcome, Registry},
};

/// Upper bound on progress requests in flight during one tick.
const MAX_CONCURRENT_FETCHES: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    Completed { name: String },
    FetchFailed { name: String, error: String },
    Submitted { name: String },
    SubmitFailed { name: String, error: String },
    TickFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Updated,
    Completed,
    Vanished,
    Failed,
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub updated: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TickReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Updated => self.updated += 1,
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Vanished | Outcome::Discarded => self.skipped += 1,
        }
    }
}

/// Registry writes from the poller happen while holding this lock, so once
/// `cancel` returns nothing further reaches the registry.
#[derive(Debug, Default)]
struct CancelGate {
    cancelled: Mutex<bool>,
}

impl CancelGate {
    fn cancel(&self) {
        *self.lock() = true;
    }

    fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    fn run<T>(&self, apply: impl FnOnce() -> T) -> Option<T> {
        let guard = self.lock();
        if *guard {
            return None;
        }
        Some(apply())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    agent: Arc<dyn Agent>,
    registry: Arc<Registry>,
    events: Sender<ReconcileEvent>,
    gate: Arc<CancelGate>,
}

impl Reconciler {
    pub fn new(
        agent: Arc<dyn Agent>,
        registry: Arc<Registry>,
        events: Sender<ReconcileEvent>,
    ) -> Self {
        Self {
            agent,
            registry,
            events,
            gate: Arc::new(CancelGate::default()),
        }
    }

    /// One reconciliation pass over the names tracked when the tick starts.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.gate.is_cancelled() {
            return report;
        }
        let snapshot = self.registry.snapshot();
        debug!("polling progress for {} torrents", snapshot.len());
        let next = AtomicUsize::new(0);
        let workers = snapshot.len().min(MAX_CONCURRENT_FETCHES);
        thread::scope(|scope| {
            let handles = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut outcomes = Vec::new();
                        while let Some(entry) = snapshot.get(next.fetch_add(1, Ordering::Relaxed))
                        {
                            outcomes.push(self.reconcile_guarded(&entry.name));
                        }
                        outcomes
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                for outcome in handle.join().unwrap_or_default() {
                    report.record(outcome);
                }
            }
        });
        if !self.gate.is_cancelled() {
            let _ = self.events.send(ReconcileEvent::TickFinished);
        }
        report
    }

    // a panicking fetch only costs its own torrent this tick
    fn reconcile_guarded(&self, name: &str) -> Outcome {
        panic::catch_unwind(AssertUnwindSafe(|| self.reconcile_one(name)))
            .unwrap_or(Outcome::Failed)
    }

    fn reconcile_one(&self, name: &str) -> Outcome {
        let result = self.agent.download_progress(name);
        self.apply(name, result)
    }

    fn apply(&self, name: &str, result: AgentResult<TorrentStatus>) -> Outcome {
        let mut status = match result {
            Ok(status) => status,
            Err(err) => {
                if self.gate.is_cancelled() {
                    return Outcome::Discarded;
                }
                warn!("failed to fetch progress for {name}: {err}");
                let _ = self.events.send(ReconcileEvent::FetchFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                });
                return Outcome::Failed;
            }
        };
        if status.name != name {
            debug!("agent answered {name} as {}", status.name);
            status.name = name.to_string();
        }

        if status.is_complete() {
            let removed = self.gate.run(|| self.registry.remove_by_name(name));
            return match removed {
                Some(true) => {
                    info!("{}", completion_message(name));
                    let _ = self.events.send(ReconcileEvent::Completed {
                        name: name.to_string(),
                    });
                    Outcome::Completed
                }
                Some(false) => Outcome::Vanished,
                None => Outcome::Discarded,
            };
        }

        match self.gate.run(|| self.registry.merge(status)) {
            Some(true) => Outcome::Updated,
            Some(false) => Outcome::Vanished,
            None => Outcome::Discarded,
        }
    }

    /// Uploads the torrent. A failure is reported but the optimistic entry
    /// stays in place. Nothing is reported once the poller has been stopped.
    pub fn submit(&self, name: &str, bytes: Vec<u8>) {
        if self.gate.is_cancelled() {
            return;
        }
        let result = self.agent.start_download(name, bytes);
        self.gate.run(|| match result {
            Ok(()) => {
                info!("submitted {name}");
                let _ = self.events.send(ReconcileEvent::Submitted {
                    name: name.to_string(),
                });
            }
            Err(err) => {
                warn!("failed to submit {name}: {err}");
                let _ = self.events.send(ReconcileEvent::SubmitFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                });
            }
        });
    }
}

enum PollCommand {
    Refresh,
}

/// Handle on the polling worker. Dropping it stops the worker and waits for
/// it to exit. Uploads still in flight are left to finish on their own
/// threads; their results are dropped.
pub struct Poller {
    uploader: Reconciler,
    commands: Option<Sender<PollCommand>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Poller {
    pub fn spawn(reconciler: Reconciler, poll_interval: Duration) -> Self {
        let uploader = reconciler.clone();
        let (tx, rx) = unbounded();
        let handle = thread::spawn(move || poll_loop(reconciler, rx, poll_interval));
        Self {
            uploader,
            commands: Some(tx),
            handle: Some(handle),
        }
    }

    /// Reads a `.torrent` file and tracks it under its file name.
    pub fn add_torrent(&self, path: &Path) -> Result<AddOutcome> {
        let is_torrent = path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(TORRENT_EXTENSION));
        if !is_torrent {
            bail!("{} is not a .{TORRENT_EXTENSION} file", path.display());
        }
        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        self.add_torrent_bytes(name, bytes)
    }

    /// Adds the optimistic entry, then starts the upload in the background.
    /// A rejected duplicate is not uploaded again.
    pub fn add_torrent_bytes(&self, name: String, bytes: Vec<u8>) -> Result<AddOutcome> {
        if self.commands.is_none() {
            bail!("poller has been stopped");
        }
        let outcome = self
            .uploader
            .registry
            .add(TorrentStatus::optimistic(name.as_str()));
        match outcome {
            AddOutcome::Rejected => {
                debug!("{name} is already tracked");
            }
            AddOutcome::Added | AddOutcome::Replaced => {
                let uploader = self.uploader.clone();
                thread::spawn(move || uploader.submit(&name, bytes));
            }
        }
        Ok(outcome)
    }

    /// Runs a tick now instead of waiting for the interval.
    pub fn refresh(&self) -> Result<()> {
        self.send(PollCommand::Refresh)
    }

    pub fn stop(&mut self) {
        self.uploader.gate.cancel();
        self.commands.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("poller thread panicked");
            }
        }
    }

    fn send(&self, command: PollCommand) -> Result<()> {
        let Some(commands) = &self.commands else {
            bail!("poller has been stopped");
        };
        commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("poller is not running"))
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(reconciler: Reconciler, rx: Receiver<PollCommand>, poll_interval: Duration) {
    let mut next_tick = Instant::now() + poll_interval;
    loop {
        match rx.recv_deadline(next_tick) {
            Ok(PollCommand::Refresh) | Err(RecvTimeoutError::Timeout) => {
                let report = reconciler.tick();
                debug!(
                    "tick: {} updated, {} completed, {} failed, {} skipped",
                    report.updated, report.completed, report.failed, report.skipped
                );
                next_tick = Instant::now() + poll_interval;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if reconciler.gate.is_cancelled() {
            break;
        }
    }
    debug!("poller stopped");
}
