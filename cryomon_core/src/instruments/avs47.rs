//! Picowatt AVS47 resistance bridge, bit-banged over serial handshake lines.
//!
//! The bridge has no UART; it exposes a 48-bit shift register clocked over
//! three control lines (clock out, data out, sense in), wired in the lab to
//! RTS/DTR/CTS of an ordinary serial port. Each exchange shifts a command
//! word out while the bridge shifts its previous state back in.
//!
//! Scanning is slow work: a channel change needs seconds of settling before
//! the reading means anything, so the sweep over the configured channels
//! runs on its own thread and hands finished results to the poller through
//! a single-slot mailbox. The poller tick stays cheap, and the scheduler's
//! backoff still paces reconnects when the thread dies.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use cryomon_config::curves::EXCITATIONS;
use cryomon_config::{Avs47Cfg, CalibrationCurve, UploadCfg};
use cryomon_traits::{Clock, HandshakePort};

use crate::error::{InstrumentError, Result};
use crate::instruments::{PortFactory, io_err};
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

/// Input range labels as printed on the front panel; code 0 is open input.
const RANGE_LABELS: [&str; 8] = ["Open", "2", "20", "200", "2k", "20k", "200k", "2M"];

const INPUT_SELECT_MEASURE: u8 = 1;
/// 30uV, a safe excitation when the channel has never reported one.
const DEFAULT_EXCITATION: u8 = 3;
/// The 2 Ohm range, the bridge's lowest.
const DEFAULT_RANGE: u8 = 1;
/// Pause between settle polls.
const SETTLE_POLL: Duration = Duration::from_secs(1);
/// Granularity of the inter-sweep pause so shutdown stays prompt.
const PAUSE_SLICE: Duration = Duration::from_millis(200);

/// One 48-bit shift-register word, both command and response.
///
/// Bit allocation, LSB first: address:6, remote:1, pad:1, input_range:3,
/// excitation:3, display:3, channel:3, input_select:2, pad:2, then the
/// readout digits digit1..digit4 at 4 bits each, digit5:1, pad to 48.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Avs47Frame {
    pub address: u8,
    pub remote: bool,
    pub input_range: u8,
    pub excitation: u8,
    pub display: u8,
    pub channel: u8,
    pub input_select: u8,
    /// Readout digits, least significant decade first.
    pub digits: [u8; 5],
}

impl Avs47Frame {
    pub fn pack(&self) -> u64 {
        let mut word = 0u64;
        word |= u64::from(self.address & 0x3F);
        word |= u64::from(self.remote) << 6;
        word |= u64::from(self.input_range & 0x7) << 8;
        word |= u64::from(self.excitation & 0x7) << 11;
        word |= u64::from(self.display & 0x7) << 14;
        word |= u64::from(self.channel & 0x7) << 17;
        word |= u64::from(self.input_select & 0x3) << 20;
        word |= u64::from(self.digits[0] & 0xF) << 24;
        word |= u64::from(self.digits[1] & 0xF) << 28;
        word |= u64::from(self.digits[2] & 0xF) << 32;
        word |= u64::from(self.digits[3] & 0xF) << 36;
        word |= u64::from(self.digits[4] & 0x1) << 40;
        word
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            address: (word & 0x3F) as u8,
            remote: (word >> 6) & 1 == 1,
            input_range: ((word >> 8) & 0x7) as u8,
            excitation: ((word >> 11) & 0x7) as u8,
            display: ((word >> 14) & 0x7) as u8,
            channel: ((word >> 17) & 0x7) as u8,
            input_select: ((word >> 20) & 0x3) as u8,
            digits: [
                ((word >> 24) & 0xF) as u8,
                ((word >> 28) & 0xF) as u8,
                ((word >> 32) & 0xF) as u8,
                ((word >> 36) & 0xF) as u8,
                ((word >> 40) & 0x1) as u8,
            ],
        }
    }

    /// Display counts, assembled from the BCD digits.
    pub fn readout(&self) -> u32 {
        self.digits
            .iter()
            .enumerate()
            .map(|(i, &d)| u32::from(d) * 10u32.pow(i as u32))
            .sum()
    }

    /// Resistance in Ohms implied by the readout and the range code.
    pub fn resistance(&self) -> f64 {
        f64::from(self.readout()) * 10f64.powi(i32::from(self.input_range) - 5)
    }
}

/// Code for an excitation label; labels come validated from the config.
fn excitation_code(label: &str) -> Option<u8> {
    EXCITATIONS
        .iter()
        .position(|&e| e == label)
        .and_then(|i| u8::try_from(i).ok())
}

/// Full-scale resistance of a range code (2 Ohm x 10^(code-1)); None for
/// the open input.
fn range_ohms(range: u8) -> Option<f64> {
    if (1..=7).contains(&range) {
        Some(2.0 * 10f64.powi(i32::from(range) - 1))
    } else {
        None
    }
}

/// Drives the bridge's synchronous serial interface bit by bit.
///
/// The address preamble goes out before every word; the bridge does not
/// latch it, which is what allows several bridges to share the lines.
pub struct Avs47Bridge<P> {
    port: P,
    address: u8,
    delay: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl<P: HandshakePort> Avs47Bridge<P> {
    pub fn new(port: P, address: u8, delay: Duration, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            port,
            address,
            delay,
            clock,
        }
    }

    /// Shift `frame` out and return the state the bridge shifted back.
    pub fn exchange(&mut self, frame: Avs47Frame) -> Result<Avs47Frame> {
        self.send_address()?;
        let word = frame.pack();
        let mut response = 0u64;
        self.port.set_clock(false).map_err(io_err)?;
        for bit_pos in (0..48).rev() {
            let bit = (word >> bit_pos) & 1 == 1;
            self.port.set_data(bit).map_err(io_err)?;
            if self.port.read_sense().map_err(io_err)? {
                response |= 1u64 << bit_pos;
            }
            self.pulse_clock()?;
        }
        self.port.set_data(false).map_err(io_err)?;
        self.end_comm()?;
        Ok(Avs47Frame::unpack(response))
    }

    fn send_address(&mut self) -> Result<()> {
        self.port.set_clock(false).map_err(io_err)?;
        for bit_pos in (0..8).rev() {
            let bit = (self.address >> bit_pos) & 1 == 1;
            self.port.set_data(bit).map_err(io_err)?;
            self.pulse_clock()?;
        }
        self.port.set_data(false).map_err(io_err)?;
        self.end_comm()
    }

    fn pulse_clock(&mut self) -> Result<()> {
        self.port.set_clock(true).map_err(io_err)?;
        self.clock.sleep(self.delay);
        self.port.set_clock(false).map_err(io_err)?;
        self.clock.sleep(self.delay);
        Ok(())
    }

    /// Three data-line pulses tell the bridge the word is complete.
    fn end_comm(&mut self) -> Result<()> {
        for _ in 0..3 {
            self.port.set_data(true).map_err(io_err)?;
            self.clock.sleep(self.delay);
            self.port.set_data(false).map_err(io_err)?;
            self.clock.sleep(self.delay);
        }
        Ok(())
    }
}

/// Per-channel scan settings with the calibration already resolved.
#[derive(Clone)]
struct ChannelPlan {
    channel: u8,
    sensor: String,
    curve: CalibrationCurve,
    excitation: u8,
    settle_delay_s: f64,
    average_count: u32,
    average_delay: Duration,
    quick_settle: bool,
}

fn build_plan(
    cfg: &Avs47Cfg,
    curves: &BTreeMap<String, CalibrationCurve>,
) -> Result<Vec<ChannelPlan>> {
    let mut plan = Vec::new();
    for (&channel, ch) in &cfg.channels {
        if !ch.enabled {
            continue;
        }
        let curve = curves.get(&ch.calibration).cloned().ok_or_else(|| {
            eyre::eyre!("no calibration named '{}' for channel {channel}", ch.calibration)
        })?;
        let excitation = excitation_code(&ch.excitation).ok_or_else(|| {
            eyre::eyre!("unknown excitation '{}' for channel {channel}", ch.excitation)
        })?;
        plan.push(ChannelPlan {
            channel,
            sensor: ch.sensor.clone(),
            curve,
            excitation,
            settle_delay_s: ch.settle_delay_s,
            average_count: ch.average_count,
            average_delay: Duration::from_secs_f64(ch.average_delay_s),
            quick_settle: ch.quick_settle,
        });
    }
    if plan.is_empty() {
        eyre::bail!("every bridge channel is disabled");
    }
    Ok(plan)
}

/// What the bridge last reported for a channel. Range starts unknown; the
/// bridge's own words fill it in.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    input_range: Option<u8>,
    excitation: Option<u8>,
    resistance: f64,
}

/// Results of one completed sweep, keyed by sensor name.
#[derive(Debug, Clone)]
struct ScanSnapshot {
    time: NaiveDateTime,
    temperatures: BTreeMap<String, f64>,
    resistances: BTreeMap<String, f64>,
}

/// Sentinel for a sweep cut short by shutdown; never reported as a failure.
#[derive(Debug, Error)]
#[error("scan interrupted by shutdown")]
struct Interrupted;

/// Sweep state machine. Owns the bridge (and with it the port) for the
/// lifetime of the scan thread.
struct Avs47Scan<P> {
    bridge: Avs47Bridge<P>,
    plan: Vec<ChannelPlan>,
    states: [ChannelState; 8],
    active: Option<u8>,
    quick_settle_points: usize,
    quick_settle_tolerance: f64,
    window: VecDeque<f64>,
    wall: Arc<dyn WallClock>,
    shutdown: Arc<AtomicBool>,
}

impl<P: HandshakePort> Avs47Scan<P> {
    fn new(
        bridge: Avs47Bridge<P>,
        plan: Vec<ChannelPlan>,
        quick_settle_points: usize,
        quick_settle_tolerance: f64,
        wall: Arc<dyn WallClock>,
    ) -> Self {
        let mut states = [ChannelState::default(); 8];
        for p in &plan {
            states[usize::from(p.channel)].excitation = Some(p.excitation);
        }
        Self {
            bridge,
            plan,
            states,
            active: None,
            quick_settle_points,
            quick_settle_tolerance,
            window: VecDeque::with_capacity(quick_settle_points),
            wall,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read the bridge's current word and adopt its channel if it is
    /// already measuring.
    fn startup(&mut self) -> Result<()> {
        let state = self.bridge.exchange(Avs47Frame::default())?;
        if state.input_select == INPUT_SELECT_MEASURE {
            let slot = &mut self.states[usize::from(state.channel)];
            slot.input_range = Some(state.input_range);
            slot.excitation = Some(state.excitation);
            slot.resistance = state.resistance();
            self.active = Some(state.channel);
        } else {
            self.active = None;
        }
        Ok(())
    }

    /// Two exchanges: select the channel under remote control, then hand
    /// the bridge back to local mode locked on it.
    fn set_channel(&mut self, plan: &ChannelPlan) -> Result<Avs47Frame> {
        let state = self.states[usize::from(plan.channel)];
        tracing::debug!(channel = plan.channel, "changing bridge channel");
        let select = Avs47Frame {
            remote: true,
            channel: plan.channel,
            input_range: state.input_range.unwrap_or(DEFAULT_RANGE),
            excitation: state.excitation.unwrap_or(DEFAULT_EXCITATION),
            input_select: INPUT_SELECT_MEASURE,
            ..Avs47Frame::default()
        };
        let lock_in = Avs47Frame {
            remote: false,
            ..select
        };
        self.bridge.exchange(select)?;
        let new_state = self.bridge.exchange(lock_in)?;
        self.active = Some(plan.channel);
        Ok(new_state)
    }

    /// Poll until `settle_delay_s` has passed since the last range change.
    ///
    /// A word on the wrong channel means someone turned the front-panel
    /// selector; nothing read after that can be trusted, so it is a hard
    /// error. With quick settle on, a full window of readings inside
    /// tolerance ends the wait early.
    fn settle(&mut self, starting_state: Avs47Frame, plan: &ChannelPlan) -> Result<()> {
        let mut state = starting_state;
        self.window.clear();
        let mut settle_start = self.bridge.clock.now();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Interrupted.into());
            }
            if self.bridge.clock.elapsed_secs(settle_start) >= plan.settle_delay_s {
                return Ok(());
            }
            if state.channel != plan.channel {
                return Err(InstrumentError::ChannelChanged {
                    expected: plan.channel,
                    found: state.channel,
                }
                .into());
            }
            let tracked = &mut self.states[usize::from(plan.channel)];
            if tracked.input_range != Some(state.input_range) {
                settle_start = self.bridge.clock.now();
                self.window.clear();
            }
            tracked.input_range = Some(state.input_range);
            tracked.resistance = state.resistance();
            if plan.quick_settle {
                self.window.push_back(state.resistance());
                if self.window.len() > self.quick_settle_points {
                    self.window.pop_front();
                }
                if self.window.len() == self.quick_settle_points {
                    if let Some(full_scale) = range_ohms(state.input_range) {
                        let spread = window_spread(&self.window);
                        let tolerance = full_scale * self.quick_settle_tolerance;
                        if spread <= tolerance {
                            tracing::debug!(
                                channel = plan.channel,
                                spread_ohm = spread,
                                "readings stable, ending settle early"
                            );
                            return Ok(());
                        }
                        tracing::debug!(
                            channel = plan.channel,
                            spread_ohm = spread,
                            tolerance_ohm = tolerance,
                            "still settling"
                        );
                    } else {
                        tracing::warn!(
                            range = RANGE_LABELS[usize::from(state.input_range)],
                            "input is open, stability check skipped"
                        );
                    }
                }
            }
            self.bridge.clock.sleep(SETTLE_POLL);
            state = self.bridge.exchange(Avs47Frame::default())?;
        }
    }

    /// Average `average_count` readings; the channel must hold still
    /// throughout or the average would mix ranges.
    fn read_resistance(&mut self, plan: &ChannelPlan) -> Result<f64> {
        let expected_range = self.states[usize::from(plan.channel)].input_range;
        let mut sum = 0.0;
        for sample in 1..=plan.average_count {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Interrupted.into());
            }
            self.bridge.clock.sleep(plan.average_delay);
            let state = self.bridge.exchange(Avs47Frame::default())?;
            if state.channel != plan.channel {
                return Err(InstrumentError::ChannelChanged {
                    expected: plan.channel,
                    found: state.channel,
                }
                .into());
            }
            if Some(state.input_range) != expected_range {
                return Err(InstrumentError::Protocol(format!(
                    "range changed mid-read on channel {}",
                    plan.channel
                ))
                .into());
            }
            let resistance = state.resistance();
            self.states[usize::from(plan.channel)].resistance = resistance;
            tracing::debug!(
                channel = plan.channel,
                sample,
                of = plan.average_count,
                resistance_ohm = resistance,
                "bridge sample"
            );
            sum += resistance;
        }
        Ok(sum / f64::from(plan.average_count))
    }

    /// Visit every planned channel once and collect the results.
    fn sweep(&mut self) -> Result<ScanSnapshot> {
        self.startup()?;
        let mut temperatures = BTreeMap::new();
        let mut resistances = BTreeMap::new();
        for idx in 0..self.plan.len() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Interrupted.into());
            }
            let plan = self.plan[idx].clone();
            if self.active != Some(plan.channel) {
                let starting_state = self.set_channel(&plan)?;
                self.settle(starting_state, &plan)?;
            }
            let resistance = self.read_resistance(&plan)?;
            resistances.insert(plan.sensor.clone(), resistance);
            match plan.curve.temperature(resistance) {
                Some(kelvin) => {
                    tracing::info!(
                        channel = plan.channel,
                        sensor = %plan.sensor,
                        temperature_k = kelvin,
                        resistance_ohm = resistance,
                        "bridge channel read"
                    );
                    temperatures.insert(plan.sensor, kelvin);
                }
                None => tracing::info!(
                    channel = plan.channel,
                    sensor = %plan.sensor,
                    resistance_ohm = resistance,
                    "temperature out of calibrated range"
                ),
            }
        }
        Ok(ScanSnapshot {
            time: self.wall.now(),
            temperatures,
            resistances,
        })
    }
}

fn window_spread(window: &VecDeque<f64>) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in window {
        min = min.min(v);
        max = max.max(v);
    }
    max - min
}

#[derive(Default)]
struct ScanShared {
    /// Single-slot mailbox; a sweep landing on an unconsumed snapshot
    /// overwrites it.
    snapshot: Mutex<Option<ScanSnapshot>>,
    /// Set once by the thread on its way out.
    failure: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the scan thread. Dropping it signals shutdown and joins; the
/// sweep checks the flag at every sleep so the join stays bounded.
struct Scanner {
    shared: Arc<ScanShared>,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Scanner {
    fn spawn<P: HandshakePort + Send + 'static>(mut scan: Avs47Scan<P>, pause: Duration) -> Result<Self> {
        let shared = Arc::new(ScanShared::default());
        let shutdown = Arc::clone(&scan.shutdown);
        let shared_clone = Arc::clone(&shared);
        let shutdown_clone = Arc::clone(&shutdown);
        let join_handle = std::thread::Builder::new()
            .name("avs47-scan".into())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Relaxed) {
                    match scan.sweep() {
                        Ok(snapshot) => {
                            let mut slot = lock(&shared_clone.snapshot);
                            if slot.replace(snapshot).is_some() {
                                tracing::warn!(
                                    "sweep finished before the previous snapshot was uploaded"
                                );
                            }
                        }
                        Err(e) if e.downcast_ref::<Interrupted>().is_some() => return,
                        Err(e) => {
                            *lock(&shared_clone.failure) = Some(format!("{e:#}"));
                            return;
                        }
                    }
                    // Pause between sweeps, sliced so shutdown stays prompt.
                    let mut remaining = pause;
                    while !remaining.is_zero() && !shutdown_clone.load(Ordering::Relaxed) {
                        let step = remaining.min(PAUSE_SLICE);
                        scan.bridge.clock.sleep(step);
                        remaining = remaining.saturating_sub(step);
                    }
                }
            })
            .map_err(|e| eyre::eyre!("spawning the scan thread: {e}"))?;
        Ok(Self {
            shared,
            shutdown,
            join_handle: Some(join_handle),
        })
    }

    fn take_snapshot(&self) -> Option<ScanSnapshot> {
        lock(&self.shared.snapshot).take()
    }

    fn failure(&self) -> Option<String> {
        lock(&self.shared.failure).take()
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("scan thread panicked during shutdown");
            }
        }
    }
}

pub struct Avs47Monitor {
    client: UploadClient,
    wall: Arc<dyn WallClock>,
    clock: Arc<dyn Clock + Send + Sync>,
    connect: PortFactory,
    scanner: Option<Scanner>,
    plan: Vec<ChannelPlan>,
    address: u8,
    bitbang_delay: Duration,
    quick_settle_points: usize,
    quick_settle_tolerance: f64,
    /// Pause between scan sweeps.
    pause: Duration,
    millikelvin: bool,
}

impl Avs47Monitor {
    pub fn new(
        cfg: &Avs47Cfg,
        upload: &UploadCfg,
        curves: &BTreeMap<String, CalibrationCurve>,
        connect: PortFactory,
        wall: Arc<dyn WallClock>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Result<Self> {
        let plan = build_plan(cfg, curves)?;
        let mut client = UploadClient::new(upload, cfg.supp.clone(), Arc::clone(&wall))?;
        client.seed_latest()?;
        Ok(Self {
            client,
            wall,
            clock,
            connect,
            scanner: None,
            plan,
            address: cfg.address,
            bitbang_delay: Duration::from_secs_f64(cfg.bitbang_delay_ms / 1000.0),
            quick_settle_points: cfg.quick_settle_points,
            quick_settle_tolerance: cfg.quick_settle_tolerance,
            pause: Duration::from_secs_f64(cfg.interval_s),
            millikelvin: cfg.upload_millikelvin,
        })
    }

    /// Open the port, sync against the bridge and start a scan thread.
    fn start_scanner(&mut self) -> Result<Scanner> {
        let port = (self.connect)()?;
        let bridge = Avs47Bridge::new(
            port,
            self.address,
            self.bitbang_delay,
            Arc::clone(&self.clock),
        );
        let mut scan = Avs47Scan::new(
            bridge,
            self.plan.clone(),
            self.quick_settle_points,
            self.quick_settle_tolerance,
            Arc::clone(&self.wall),
        );
        scan.startup()?;
        tracing::info!(address = self.address, "connected to the resistance bridge");
        Scanner::spawn(scan, self.pause)
    }
}

impl Poller for Avs47Monitor {
    fn name(&self) -> &str {
        "avs47"
    }

    fn poll(&mut self) -> Result<Progress> {
        // Drain a finished sweep before anything else so a dying thread
        // cannot take its last scan with it.
        if let Some(snapshot) = self.scanner.as_ref().and_then(Scanner::take_snapshot) {
            let mut batch = Batch::new(snapshot.time);
            for (sensor, kelvin) in &snapshot.temperatures {
                let value = if self.millikelvin { kelvin * 1000.0 } else { *kelvin };
                batch.insert(sensor.clone(), value);
            }
            tracing::debug!(resistances_ohm = ?snapshot.resistances, "sweep complete");
            self.client.upload(&batch)?;
            return Ok(Progress::Advanced);
        }
        if let Some(scanner) = &self.scanner {
            if let Some(failure) = scanner.failure() {
                tracing::error!(error = %failure, "bridge scan failed, reconnecting");
                self.scanner = None;
                return Err(eyre::eyre!(failure));
            }
            return Ok(Progress::Idle);
        }
        self.scanner = Some(self.start_scanner()?);
        Ok(Progress::Idle)
    }
}
