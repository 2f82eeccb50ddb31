//! Per-uploader supervision.
//!
//! One OS thread per configured uploader. Each thread drains its poller
//! until [`Progress::Idle`], sleeps the poller's interval, and repeats;
//! transient failures back off under [`RetryPolicy::poller`]. A fatal
//! failure ends only that thread: the supervisor logs the event and leaves
//! the rest running, or rebuilds the poller when restarts are configured.
//!
//! Sleeps happen in short slices so a ctrl-c is honored within a fraction
//! of a second even while a poller is deep in backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use cryomon_config::UploadCfg;
use cryomon_traits::Clock;

use crate::error::{Report, Result, is_retryable};
use crate::retry::{RetryPolicy, RetrySchedule};
use crate::{Poller, Progress};

/// Builds (and rebuilds) one uploader. Invoked once before the thread
/// spawns, and again after each fatal failure when restarts are on.
pub type PollerFactory = Box<dyn FnMut() -> Result<Box<dyn Poller>> + Send>;

/// How often sleeping threads re-check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum SupervisorEvent {
    /// A poller hit a fatal error. Its thread exits unless restarts are
    /// configured.
    PollerFailed { name: String, error: Report },
}

/// What a poller thread does after a fatal failure.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub wait: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            wait: Duration::from_secs(30),
        }
    }
}

impl From<&UploadCfg> for RestartPolicy {
    fn from(cfg: &UploadCfg) -> Self {
        Self {
            enabled: cfg.restart_on_failure,
            wait: Duration::from_secs_f64(cfg.restart_wait_s),
        }
    }
}

pub struct Supervisor {
    clock: Arc<dyn Clock + Send + Sync>,
    shutdown: Arc<AtomicBool>,
    restart: RestartPolicy,
    events_tx: Sender<SupervisorEvent>,
    events_rx: Receiver<SupervisorEvent>,
    threads: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        restart: RestartPolicy,
        clock: Arc<dyn Clock + Send + Sync>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            clock,
            shutdown,
            restart,
            events_tx,
            events_rx,
            threads: Vec::new(),
        }
    }

    /// The flag poller threads watch; flip it to stop everything.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Build one uploader and start its thread.
    ///
    /// The first build runs on the calling thread: a poller that cannot
    /// construct (bad config, missing log directory) fails here, before
    /// anything spawns.
    pub fn spawn(&mut self, mut build: PollerFactory) -> Result<()> {
        let poller = build()?;
        let name = poller.name().to_string();
        let clock = Arc::clone(&self.clock);
        let shutdown = Arc::clone(&self.shutdown);
        let events = self.events_tx.clone();
        let restart = self.restart;
        let handle = std::thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || {
                poller_thread(poller, build, &name, restart, &clock, &shutdown, &events);
            })
            .map_err(|e| eyre::eyre!("spawning poller thread: {e}"))?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn poller_count(&self) -> usize {
        self.threads.len()
    }

    /// Log failures until shutdown is requested or every poller thread has
    /// exited, then join them all.
    ///
    /// Returns `Ok` on a requested shutdown; all pollers dying on their own
    /// is an error.
    pub fn run(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            eyre::bail!("no uploaders enabled");
        }
        let all_died = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested, stopping uploaders");
                break false;
            }
            match self.events_rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(SupervisorEvent::PollerFailed { name, error }) => {
                    tracing::error!(
                        uploader = %name,
                        error = format!("{error:#}"),
                        "uploader failed"
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.threads.iter().all(JoinHandle::is_finished) {
                        break true;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break true,
            }
        };
        self.shutdown.store(true, Ordering::Relaxed);
        let count = self.threads.len();
        self.join_all();
        if all_died {
            eyre::bail!("all {count} uploaders have stopped");
        }
        Ok(())
    }

    fn join_all(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("poller").to_string();
            if handle.join().is_err() {
                tracing::warn!(thread = %name, "poller thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_all();
    }
}

fn poller_thread(
    mut poller: Box<dyn Poller>,
    mut build: PollerFactory,
    name: &str,
    restart: RestartPolicy,
    clock: &Arc<dyn Clock + Send + Sync>,
    shutdown: &AtomicBool,
    events: &Sender<SupervisorEvent>,
) {
    loop {
        let Some(error) = run_poller(poller.as_mut(), clock.as_ref(), shutdown) else {
            return;
        };
        // The receiver only goes away during teardown; nothing to do then.
        let _ = events.send(SupervisorEvent::PollerFailed {
            name: name.to_string(),
            error,
        });
        if !restart.enabled {
            return;
        }
        tracing::info!(
            uploader = %name,
            wait_s = restart.wait.as_secs_f64(),
            "restarting uploader"
        );
        if !wait_interruptible(clock.as_ref(), shutdown, restart.wait) {
            return;
        }
        match rebuild(&mut build, clock.as_ref(), shutdown) {
            Ok(Some(rebuilt)) => poller = rebuilt,
            Ok(None) => return,
            Err(error) => {
                let _ = events.send(SupervisorEvent::PollerFailed {
                    name: name.to_string(),
                    error,
                });
                return;
            }
        }
    }
}

/// Drain-and-sleep loop for one poller.
///
/// Returns `None` when shutdown interrupted it, `Some(error)` on a fatal
/// poll failure (non-retryable, or the retry budget ran out).
fn run_poller(
    poller: &mut dyn Poller,
    clock: &dyn Clock,
    shutdown: &AtomicBool,
) -> Option<Report> {
    let mut schedule = RetrySchedule::new(RetryPolicy::poller());
    while !shutdown.load(Ordering::Relaxed) {
        match poller.poll() {
            Ok(Progress::Advanced) => schedule.reset(),
            Ok(Progress::Idle) => {
                schedule.reset();
                if !wait_interruptible(clock, shutdown, poller.interval()) {
                    return None;
                }
            }
            Err(e) => {
                if !is_retryable(&e) {
                    return Some(e);
                }
                let Some(wait) = schedule.next_wait() else {
                    return Some(e);
                };
                tracing::error!(
                    uploader = poller.name(),
                    error = format!("{e:#}"),
                    attempt = schedule.failures(),
                    wait_s = wait.as_secs_f64(),
                    "poll failed, backing off"
                );
                if !wait_interruptible(clock, shutdown, wait) {
                    return None;
                }
            }
        }
    }
    None
}

/// Re-run the factory under the startup retry policy.
///
/// `Ok(None)` means shutdown arrived mid-rebuild; a non-retryable build
/// error is returned so the thread can report it and exit.
fn rebuild(
    build: &mut PollerFactory,
    clock: &dyn Clock,
    shutdown: &AtomicBool,
) -> Result<Option<Box<dyn Poller>>> {
    let mut schedule = RetrySchedule::new(RetryPolicy::default());
    while !shutdown.load(Ordering::Relaxed) {
        match build() {
            Ok(poller) => return Ok(Some(poller)),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                let Some(wait) = schedule.next_wait() else {
                    return Err(e);
                };
                tracing::error!(
                    error = format!("{e:#}"),
                    attempt = schedule.failures(),
                    wait_s = wait.as_secs_f64(),
                    "rebuild failed, backing off"
                );
                if !wait_interruptible(clock, shutdown, wait) {
                    return Ok(None);
                }
            }
        }
    }
    Ok(None)
}

/// Sleep `d` in [`SHUTDOWN_POLL`] slices, bailing as soon as shutdown is
/// flagged. Returns whether the full duration elapsed.
pub fn wait_interruptible(clock: &dyn Clock, shutdown: &AtomicBool, d: Duration) -> bool {
    let deadline = clock.now() + d;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = clock.now();
        if now >= deadline {
            return true;
        }
        clock.sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}
