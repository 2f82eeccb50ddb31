//! Deterministic stand-ins for the lab instruments.
//!
//! Each simulated device sits behind the same seam as the real thing
//! ([`Transport`] or [`HandshakePort`]) and is modelled from the wire
//! side, framing and handshakes included, so the drivers exercise their
//! full protocol path against it. Readings follow fixed ripple tables;
//! two runs produce identical traces.

use std::collections::VecDeque;
use std::time::Duration;

use cryomon_traits::{HandshakePort, Transport};

use crate::error::HwError;

/// A device with nothing queued looks like a silent line.
fn take_exact(queue: &mut VecDeque<u8>, n: usize) -> Result<Vec<u8>, HwError> {
    if queue.len() < n {
        return Err(HwError::Timeout);
    }
    Ok(queue.drain(..n).collect())
}

fn take_until(queue: &mut VecDeque<u8>, terminator: u8) -> Result<Vec<u8>, HwError> {
    match queue.iter().position(|&b| b == terminator) {
        Some(i) => Ok(queue.drain(..=i).collect()),
        None => Err(HwError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Lakeshore Model 336

const LAKESHORE_IDN: &str = "LSCI,MODEL336,LSA1853,2.9";
/// Base reading in Kelvin per input letter.
const LAKESHORE_INPUTS: [(char, f64); 4] = [('A', 3.21), ('B', 45.6), ('C', 293.4), ('D', 1.35)];
/// Per-mille ripple applied to each reading, one step per query.
const RIPPLE: [i64; 8] = [0, 2, 3, 2, 0, -2, -3, -2];

fn rippled(base: f64, tick: u64) -> f64 {
    base * (1.0 + RIPPLE[(tick % 8) as usize] as f64 / 1000.0)
}

/// A Model 336 with four populated inputs, each drifting gently around its
/// base temperature.
#[derive(Default)]
pub struct SimLakeshore336 {
    pending: VecDeque<u8>,
    ticks: u64,
}

impl SimLakeshore336 {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self, line: &str) {
        let cmd = line.trim_end_matches(['\r', '\n']);
        if cmd == "*IDN?" {
            self.pending.extend(format!("{LAKESHORE_IDN}\r\n").bytes());
            return;
        }
        if let Some(input) = cmd.strip_prefix("KRDG? ") {
            let kelvin = LAKESHORE_INPUTS
                .iter()
                .find(|(letter, _)| input == letter.to_string())
                .map(|&(_, base)| rippled(base, self.ticks))
                .unwrap_or(0.0);
            self.ticks += 1;
            self.pending.extend(format!("{kelvin:+.5E}\r\n").bytes());
            return;
        }
        tracing::debug!(%cmd, "simulated 336 ignoring command");
    }
}

impl Transport for SimLakeshore336 {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for line in String::from_utf8_lossy(bytes).split_inclusive('\n') {
            self.handle(line);
        }
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_exact(&mut self.pending, n).map_err(Into::into)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_until(&mut self.pending, terminator).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Pfeiffer MaxiGauge

const ACK: [u8; 3] = [0x06, 0x0D, 0x0A];
const NAK: [u8; 3] = [0x15, 0x0D, 0x0A];
const ENQ: u8 = 0x05;

/// Base pressure in mbar per channel slot; `None` is an empty slot.
const GAUGES: [Option<f64>; 6] = [Some(9.7e2), Some(1.3e-1), Some(4.1e-6), None, None, None];

/// A six-channel MaxiGauge speaking the ACK/ENQ handshake, with gauges on
/// the first three channels.
#[derive(Default)]
pub struct SimMaxiGauge {
    rx: Vec<u8>,
    pending: VecDeque<u8>,
    /// Acknowledged command whose data is owed on the next ENQ.
    awaiting: Option<String>,
    ticks: u64,
}

impl SimMaxiGauge {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept(&self, cmd: &str) -> bool {
        if cmd == "CID" {
            return true;
        }
        matches!(cmd.strip_prefix("PR"), Some(ch) if matches!(ch.parse::<u8>(), Ok(1..=6)))
    }

    fn enquire(&mut self) {
        let Some(cmd) = self.awaiting.take() else {
            return;
        };
        if cmd == "CID" {
            let ids: Vec<&str> = GAUGES
                .iter()
                .map(|slot| if slot.is_some() { "PKR" } else { "NON" })
                .collect();
            self.pending.extend(format!("{}\r\n", ids.join(",")).bytes());
            return;
        }
        // accept() already vetted the channel number.
        let channel: usize = cmd[2..].parse().unwrap_or(1);
        let line = match GAUGES[channel - 1] {
            Some(base) => {
                let mbar = rippled(base, self.ticks);
                self.ticks += 1;
                format!("0,{mbar:.4E}\r\n")
            }
            None => "5,2.0000E-2\r\n".to_string(),
        };
        self.pending.extend(line.bytes());
    }

    fn pump(&mut self) {
        loop {
            if self.rx.first() == Some(&ENQ) {
                self.rx.remove(0);
                self.enquire();
                continue;
            }
            let Some(end) = self.rx.iter().position(|&b| b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.rx.drain(..=end).collect();
            let cmd = String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if self.accept(&cmd) {
                self.pending.extend(ACK);
                self.awaiting = Some(cmd);
            } else {
                self.pending.extend(NAK);
                self.awaiting = None;
            }
        }
    }
}

impl Transport for SimMaxiGauge {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.rx.extend_from_slice(bytes);
        self.pump();
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_exact(&mut self.pending, n).map_err(Into::into)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_until(&mut self.pending, terminator).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Cryomech CPA panel

const STX: u8 = 0x02;
const CR: u8 = 0x0D;
const ESC: u8 = 0x07;
const CMD_READ: u8 = 0x63;

/// Register values of a healthy running compressor, in panel units
/// (tenths of a degree, tenths of a PSI, minutes).
const CRYOMECH_REGISTERS: [([u8; 3], i32); 11] = [
    ([0x45, 0x4C, 0x00], 126_420), // run time, minutes
    ([0x63, 0x8B, 0x00], 23),      // motor current, A
    ([0x0D, 0x8F, 0x00], 182),     // water in
    ([0x0D, 0x8F, 0x01], 294),     // water out
    ([0x0D, 0x8F, 0x02], 412),     // helium
    ([0x0D, 0x8F, 0x03], 389),     // oil
    ([0xBB, 0x94, 0x00], 1555),    // avg low side
    ([0x7E, 0x90, 0x00], 2860),    // avg high side
    ([0x31, 0x9C, 0x00], 1305),    // avg delta
    ([0x66, 0xFA, 0x00], 15),      // avg bounce
    ([0x5F, 0x95, 0x00], 1),       // compressor state
];
/// Instantaneous pressure; ripples around its base so a bounce estimate
/// built on top of it comes out non-zero.
const REG_PRESSURE: [u8; 3] = [0xAA, 0x50, 0x00];
const PRESSURE_BASE: i32 = 2100;
const PRESSURE_RIPPLE: [i32; 6] = [0, 9, 14, 9, 0, -12];

fn v1_checksum(payload: &[u8]) -> [u8; 2] {
    let sum = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    [(sum >> 4) + 0x40, (sum & 0x0F) + 0x40]
}

fn v1_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(STX);
    for &b in payload {
        match b {
            STX => out.extend([ESC, 0x30]),
            CR => out.extend([ESC, 0x31]),
            ESC => out.extend([ESC, 0x32]),
            _ => out.push(b),
        }
    }
    out.extend(v1_checksum(payload));
    out.push(CR);
    out
}

fn v1_unstuff(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b != ESC {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(0x30) => out.push(STX),
            Some(0x31) => out.push(CR),
            Some(0x32) => out.push(ESC),
            _ => return None,
        }
    }
    Some(out)
}

/// A first-generation CPA panel answering read commands at one address.
pub struct SimCryomech {
    address: u8,
    rx: Vec<u8>,
    pending: VecDeque<u8>,
    pressure_phase: usize,
}

impl SimCryomech {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            rx: Vec::new(),
            pending: VecDeque::new(),
            pressure_phase: 0,
        }
    }

    fn register(&mut self, reg: [u8; 3]) -> i32 {
        if reg == REG_PRESSURE {
            let ripple = PRESSURE_RIPPLE[self.pressure_phase % PRESSURE_RIPPLE.len()];
            self.pressure_phase += 1;
            return PRESSURE_BASE + ripple;
        }
        CRYOMECH_REGISTERS
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|&(_, v)| v)
            .unwrap_or(0)
    }

    fn packet(&mut self, packet: &[u8]) {
        // Strip framing, undo stuffing, check integrity; a real panel drops
        // anything garbled without a reply.
        let inner = &packet[1..packet.len() - 1];
        if inner.len() < 2 {
            return;
        }
        let (stuffed, check) = inner.split_at(inner.len() - 2);
        let Some(payload) = v1_unstuff(stuffed) else {
            return;
        };
        if v1_checksum(&payload) != [check[0], check[1]] {
            return;
        }
        let [dev, host, CMD_READ, r0, r1, r2, seq] = payload[..] else {
            return;
        };
        if dev != self.address {
            return;
        }
        let value = self.register([r0, r1, r2]);
        let mut reply = vec![dev, host, CMD_READ, r0, r1, r2];
        reply.extend(value.to_be_bytes());
        reply.push(seq);
        self.pending.extend(v1_frame(&reply));
    }

    fn pump(&mut self) {
        // Stuffing keeps CR out of payloads, so a raw CR always ends a
        // packet.
        while let Some(end) = self.rx.iter().position(|&b| b == CR) {
            let packet: Vec<u8> = self.rx.drain(..=end).collect();
            if packet.first() == Some(&STX) && packet.len() >= 4 {
                self.packet(&packet);
            }
        }
    }
}

impl Transport for SimCryomech {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.rx.extend_from_slice(bytes);
        self.pump();
        Ok(())
    }

    fn recv_exact(
        &mut self,
        n: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_exact(&mut self.pending, n).map_err(Into::into)
    }

    fn recv_until(
        &mut self,
        terminator: u8,
        _timeout: Duration,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        take_until(&mut self.pending, terminator).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Picowatt AVS47 bridge

/// Resistance in Ohms per channel; spans several ranges so autoranging
/// actually moves.
const AVS47_RESISTANCES: [f64; 8] = [48.3, 104.2, 1482.0, 21_700.0, 3.9, 187.5, 66_000.0, 0.4];

const INPUT_SELECT_MEASURE: u8 = 1;

/// Bit-level model of the bridge's synchronous interface.
///
/// The host clocks an 8-bit address preamble, then a 48-bit word; three
/// data-line pulses with the clock held low mark the end of each. The word
/// shifted back on the sense line is the state the bridge held when the
/// word began, and a word with the remote bit set takes effect when its
/// end mark lands.
pub struct SimAvs47 {
    address: u8,
    resistances: [f64; 8],
    clock_high: bool,
    data_high: bool,
    /// Data-line level captured at each rising clock edge.
    rx: Vec<bool>,
    /// Data-line rising edges since the last clock pulse.
    data_edges: u8,
    /// Response bits for the sense line, most significant first.
    tx: VecDeque<bool>,
    /// Whether the preamble opening the current word addressed us.
    selected: bool,
    remote: bool,
    channel: u8,
    input_range: u8,
    excitation: u8,
    display: u8,
    input_select: u8,
}

impl SimAvs47 {
    pub fn new(address: u8) -> Self {
        let mut bridge = Self {
            address,
            resistances: AVS47_RESISTANCES,
            clock_high: false,
            data_high: false,
            rx: Vec::new(),
            data_edges: 0,
            tx: VecDeque::new(),
            selected: false,
            remote: false,
            channel: 0,
            input_range: 0,
            excitation: 3,
            display: 0,
            input_select: INPUT_SELECT_MEASURE,
        };
        // Powers up measuring channel 0 under local control.
        bridge.autorange();
        bridge
    }

    pub fn set_resistance(&mut self, channel: u8, ohms: f64) {
        self.resistances[usize::from(channel & 0x7)] = ohms;
        self.autorange();
    }

    /// Smallest range whose full scale covers the active channel.
    fn autorange(&mut self) {
        if self.input_select != INPUT_SELECT_MEASURE {
            self.input_range = 0;
            return;
        }
        let ohms = self.resistances[usize::from(self.channel)];
        self.input_range = (1..=7)
            .find(|&code| ohms <= 1.9999 * 10f64.powi(i32::from(code) - 1))
            .unwrap_or(7);
    }

    /// Display counts for the current channel and range.
    fn counts(&self) -> u64 {
        if self.input_select != INPUT_SELECT_MEASURE || !(1..=7).contains(&self.input_range) {
            return 0;
        }
        let ohms = self.resistances[usize::from(self.channel)];
        let counts = (ohms * 10f64.powi(5 - i32::from(self.input_range))).round();
        (counts as u64).min(19_999)
    }

    fn pack_state(&self) -> u64 {
        let counts = self.counts();
        let mut word = 0u64;
        word |= u64::from(self.address & 0x3F);
        word |= u64::from(self.remote) << 6;
        word |= u64::from(self.input_range & 0x7) << 8;
        word |= u64::from(self.excitation & 0x7) << 11;
        word |= u64::from(self.display & 0x7) << 14;
        word |= u64::from(self.channel & 0x7) << 17;
        word |= u64::from(self.input_select & 0x3) << 20;
        word |= (counts % 10) << 24;
        word |= ((counts / 10) % 10) << 28;
        word |= ((counts / 100) % 10) << 32;
        word |= ((counts / 1000) % 10) << 36;
        word |= ((counts / 10_000) & 1) << 40;
        word
    }

    fn apply(&mut self, word: u64) {
        self.remote = (word >> 6) & 1 == 1;
        if !self.remote {
            return;
        }
        self.channel = ((word >> 17) & 0x7) as u8;
        self.excitation = ((word >> 11) & 0x7) as u8;
        self.display = ((word >> 14) & 0x7) as u8;
        self.input_select = ((word >> 20) & 0x3) as u8;
        self.input_range = ((word >> 8) & 0x7) as u8;
        tracing::debug!(
            channel = self.channel,
            "simulated bridge took a remote command"
        );
        self.autorange();
    }

    /// Third data pulse with the clock low: the shifted bits are a
    /// complete unit.
    fn end_mark(&mut self) {
        match self.rx.len() {
            8 => {
                let addr = self.rx.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b));
                self.selected = addr == self.address;
                self.tx.clear();
                if self.selected {
                    let word = self.pack_state();
                    for bit_pos in (0..48).rev() {
                        self.tx.push_back((word >> bit_pos) & 1 == 1);
                    }
                }
            }
            48 => {
                if self.selected {
                    let word = self
                        .rx
                        .iter()
                        .fold(0u64, |acc, &b| (acc << 1) | u64::from(b));
                    self.apply(word);
                }
            }
            // Noise between words; a real bridge shrugs it off.
            _ => {}
        }
        self.rx.clear();
        self.data_edges = 0;
    }
}

impl HandshakePort for SimAvs47 {
    fn set_clock(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if high && !self.clock_high {
            self.rx.push(self.data_high);
            self.tx.pop_front();
            self.data_edges = 0;
        }
        self.clock_high = high;
        Ok(())
    }

    fn set_data(&mut self, high: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if high && !self.data_high {
            self.data_edges += 1;
            if self.data_edges == 3 {
                self.data_high = high;
                self.end_mark();
                return Ok(());
            }
        }
        self.data_high = high;
        Ok(())
    }

    fn read_sense(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.tx.front().copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_line(sim: &mut impl Transport, line: &str) {
        sim.send(line.as_bytes()).unwrap();
    }

    fn read_line(sim: &mut impl Transport) -> String {
        let raw = sim.recv_until(b'\n', Duration::from_secs(1)).unwrap();
        String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }

    #[test]
    fn lakeshore_identifies_and_reads_kelvin() {
        let mut sim = SimLakeshore336::new();
        send_line(&mut sim, "*IDN?\n");
        assert_eq!(read_line(&mut sim), LAKESHORE_IDN);

        send_line(&mut sim, "KRDG? A\n");
        let kelvin: f64 = read_line(&mut sim).parse().unwrap();
        assert!((kelvin - 3.21).abs() < 0.1);

        // Silent line for an unknown command.
        send_line(&mut sim, "RANGE? 1\n");
        assert!(sim.recv_until(b'\n', Duration::from_secs(1)).is_err());
    }

    #[test]
    fn lakeshore_readings_ripple_but_repeat() {
        let mut a = SimLakeshore336::new();
        let mut b = SimLakeshore336::new();
        let series = |sim: &mut SimLakeshore336| -> Vec<f64> {
            (0..10)
                .map(|_| {
                    send_line(sim, "KRDG? B\n");
                    read_line(sim).parse().unwrap()
                })
                .collect()
        };
        let first = series(&mut a);
        assert_eq!(first, series(&mut b));
        assert!(first.iter().any(|&v| v != first[0]));
    }

    #[test]
    fn maxigauge_acks_then_answers_on_enq() {
        let mut sim = SimMaxiGauge::new();
        send_line(&mut sim, "PR1\r\n");
        assert_eq!(
            sim.recv_exact(3, Duration::from_secs(1)).unwrap(),
            ACK.to_vec()
        );
        sim.send(&[ENQ]).unwrap();
        let reply = read_line(&mut sim);
        let (status, value) = reply.split_once(',').unwrap();
        assert_eq!(status, "0");
        assert!((value.parse::<f64>().unwrap() - 970.0).abs() < 10.0);
    }

    #[test]
    fn maxigauge_naks_unknown_commands() {
        let mut sim = SimMaxiGauge::new();
        send_line(&mut sim, "PR7\r\n");
        assert_eq!(
            sim.recv_exact(3, Duration::from_secs(1)).unwrap(),
            NAK.to_vec()
        );
        // An ENQ after a NAK has nothing to fetch.
        sim.send(&[ENQ]).unwrap();
        assert!(sim.recv_until(b'\n', Duration::from_secs(1)).is_err());
    }

    #[test]
    fn maxigauge_reports_empty_slots() {
        let mut sim = SimMaxiGauge::new();
        send_line(&mut sim, "PR5\r\n");
        sim.recv_exact(3, Duration::from_secs(1)).unwrap();
        sim.send(&[ENQ]).unwrap();
        assert!(read_line(&mut sim).starts_with("5,"));
    }

    fn v1_read(sim: &mut SimCryomech, addr: u8, reg: [u8; 3], seq: u8) -> Option<(i32, u8)> {
        let cmd = [addr, 0x80, CMD_READ, reg[0], reg[1], reg[2], seq];
        sim.send(&v1_frame(&cmd)).unwrap();
        let raw = sim.recv_until(CR, Duration::from_secs(1)).ok()?;
        let inner = &raw[1..raw.len() - 1];
        let payload = v1_unstuff(&inner[..inner.len() - 2]).unwrap();
        assert_eq!(payload.len(), 11);
        let value = i32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);
        Some((value, payload[10]))
    }

    #[test]
    fn cryomech_answers_reads_with_the_sequence_echoed() {
        let mut sim = SimCryomech::new(16);
        let (state, echo) = v1_read(&mut sim, 16, [0x5F, 0x95, 0x00], 0x2A).unwrap();
        assert_eq!(state, 1);
        assert_eq!(echo, 0x2A);

        let (minutes, _) = v1_read(&mut sim, 16, [0x45, 0x4C, 0x00], 0x2B).unwrap();
        assert_eq!(minutes, 126_420);
    }

    #[test]
    fn cryomech_ignores_other_addresses_and_bad_checksums() {
        let mut sim = SimCryomech::new(16);
        assert!(v1_read(&mut sim, 9, [0x5F, 0x95, 0x00], 0x10).is_none());

        let mut packet = v1_frame(&[16, 0x80, CMD_READ, 0x5F, 0x95, 0x00, 0x10]);
        packet[1] ^= 0x01;
        sim.send(&packet).unwrap();
        assert!(sim.recv_until(CR, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn cryomech_instantaneous_pressure_ripples() {
        let mut sim = SimCryomech::new(16);
        let values: Vec<i32> = (0..6)
            .map(|i| v1_read(&mut sim, 16, REG_PRESSURE, 0x10 + i).unwrap().0)
            .collect();
        assert_eq!(values, vec![2100, 2109, 2114, 2109, 2100, 2088]);
    }

    /// Drive one address-plus-word exchange the way the host does, and
    /// return the word shifted back.
    fn exchange(sim: &mut SimAvs47, address: u8, word: u64) -> u64 {
        sim.set_clock(false).unwrap();
        for bit_pos in (0..8).rev() {
            sim.set_data((address >> bit_pos) & 1 == 1).unwrap();
            sim.set_clock(true).unwrap();
            sim.set_clock(false).unwrap();
        }
        sim.set_data(false).unwrap();
        for _ in 0..3 {
            sim.set_data(true).unwrap();
            sim.set_data(false).unwrap();
        }
        let mut response = 0u64;
        for bit_pos in (0..48).rev() {
            sim.set_data((word >> bit_pos) & 1 == 1).unwrap();
            if sim.read_sense().unwrap() {
                response |= 1 << bit_pos;
            }
            sim.set_clock(true).unwrap();
            sim.set_clock(false).unwrap();
        }
        sim.set_data(false).unwrap();
        for _ in 0..3 {
            sim.set_data(true).unwrap();
            sim.set_data(false).unwrap();
        }
        response
    }

    fn field(word: u64, shift: u32, mask: u64) -> u64 {
        (word >> shift) & mask
    }

    fn readout(word: u64) -> u64 {
        field(word, 24, 0xF)
            + field(word, 28, 0xF) * 10
            + field(word, 32, 0xF) * 100
            + field(word, 36, 0xF) * 1000
            + field(word, 40, 0x1) * 10_000
    }

    #[test]
    fn avs47_powers_up_measuring_channel_zero() {
        let mut sim = SimAvs47::new(1);
        let word = exchange(&mut sim, 1, 0);
        assert_eq!(field(word, 17, 0x7), 0, "channel");
        assert_eq!(field(word, 20, 0x3), u64::from(INPUT_SELECT_MEASURE));
        // 48.3 Ohm autoranges to 200 Ohm full scale (code 3) and displays
        // 4830 counts.
        assert_eq!(field(word, 8, 0x7), 3, "range");
        assert_eq!(readout(word), 4830);
    }

    #[test]
    fn avs47_reranges_when_a_resistance_moves() {
        let mut sim = SimAvs47::new(1);
        sim.set_resistance(0, 3.9);
        let word = exchange(&mut sim, 1, 0);
        // 3.9 Ohm drops from the 200 Ohm range to the 20 Ohm range.
        assert_eq!(field(word, 8, 0x7), 2, "range");
        assert_eq!(readout(word), 3900);
    }

    #[test]
    fn avs47_takes_remote_commands_and_answers_with_prior_state() {
        let mut sim = SimAvs47::new(1);
        let select = 1 << 6                       // remote
            | 1 << 8                              // range code 1
            | 3 << 11                             // excitation
            | u64::from(INPUT_SELECT_MEASURE) << 20
            | 3 << 17; // channel 3
        let before = exchange(&mut sim, 1, select);
        // The reply predates the command: still channel 0.
        assert_eq!(field(before, 17, 0x7), 0);

        let after = exchange(&mut sim, 1, 0);
        assert_eq!(field(after, 17, 0x7), 3);
        // 21.7 kOhm lands on the 200k range, 2170 counts.
        assert_eq!(field(after, 8, 0x7), 6);
        assert_eq!(readout(after), 2170);
        assert!((2170.0 * 10f64.powi(6 - 5) - 21_700.0).abs() < 1e-9);
    }

    #[test]
    fn avs47_ignores_words_without_the_remote_bit() {
        let mut sim = SimAvs47::new(1);
        let plain = 5 << 17 | u64::from(INPUT_SELECT_MEASURE) << 20;
        exchange(&mut sim, 1, plain);
        let word = exchange(&mut sim, 1, 0);
        assert_eq!(field(word, 17, 0x7), 0, "query must not move the channel");
    }

    #[test]
    fn avs47_stays_silent_for_another_address() {
        let mut sim = SimAvs47::new(1);
        assert_eq!(exchange(&mut sim, 2, 0), 0);
        // And still answers its own address afterwards.
        assert_ne!(exchange(&mut sim, 1, 0), 0);
    }
}
