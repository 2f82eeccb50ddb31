//! Test doubles for clocks and instrument transports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use cryomon_traits::{Clock, Transport};

use crate::time::WallClock;

/// Deterministic monotonic clock: `sleep` advances time without sleeping and
/// records the requested duration.
#[derive(Debug, Clone)]
pub struct FakeClock {
    origin: Instant,
    state: Arc<Mutex<FakeClockState>>,
}

#[derive(Debug, Default)]
struct FakeClockState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(FakeClockState::default())),
        }
    }

    pub fn advance(&self, d: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.offset = s.offset.saturating_add(d);
        }
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().map(|s| s.sleeps.clone()).unwrap_or_default()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let off = self.state.lock().map(|s| s.offset).unwrap_or(Duration::ZERO);
        self.origin + off
    }

    fn sleep(&self, d: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.sleeps.push(d);
            s.offset = s.offset.saturating_add(d);
        }
    }
}

/// Wall clock pinned to whatever a test sets it to.
#[derive(Debug, Clone)]
pub struct ManualWallClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualWallClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: NaiveDateTime) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    pub fn advance(&self, d: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += d;
        }
    }
}

impl WallClock for ManualWallClock {
    fn now(&self) -> NaiveDateTime {
        self.now.lock().map(|t| *t).unwrap_or_default()
    }
}

/// In-memory transport: tests preload reply bytes and inspect what was sent.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    inbox: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes the instrument "replies" with.
    pub fn push_reply(&self, bytes: &[u8]) {
        if let Ok(mut s) = self.state.lock() {
            s.inbox.extend(bytes);
        }
    }

    /// Every `send` payload, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn unread(&self) -> usize {
        self.state.lock().map(|s| s.inbox.len()).unwrap_or(0)
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        s.sent.push(bytes.to_vec());
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        if s.inbox.len() < n {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "scripted transport out of bytes",
            )));
        }
        Ok(s.inbox.drain(..n).collect())
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        let Some(pos) = s.inbox.iter().position(|b| *b == terminator) else {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "scripted transport missing terminator",
            )));
        };
        Ok(s.inbox.drain(..=pos).collect())
    }
}

fn poisoned() -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(std::io::Error::other("scripted transport poisoned"))
}
