//! Cryomech compressor, read over the CPA panel's binary serial protocol.
//!
//! Packets are STX-framed with byte stuffing and a two-nibble checksum:
//! `0x02 | stuffed payload | checksum | 0x0D`. A read command names a
//! three-byte register; the reply echoes the request plus a big-endian
//! `i32` value and the request's sequence number. Temperatures and
//! pressures come back in tenths of a degree / PSI.
//!
//! The panel's own "bounce" register smooths heavily, so the monitor can
//! instead estimate bounce from its own history of instantaneous pressures
//! (`use_calculated_bounce`), the same way the BlueFors log monitor does.

use std::sync::Arc;
use std::time::Duration;

use cryomon_config::{CryomechCfg, UploadCfg};
use cryomon_traits::Transport;

use crate::bounce::BounceWindow;
use crate::error::{InstrumentError, Result};
use crate::instruments::{TransportFactory, io_err, upload_due};
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

const STX: u8 = 0x02;
const CR: u8 = 0x0D;
const ESC: u8 = 0x07;
const HOST_ADDR: u8 = 0x80;
const CMD_READ: u8 = 0x63;

// Register triples from the CPA panel's serial map.
const REG_RUNTIME_MIN: [u8; 3] = [0x45, 0x4C, 0x00];
const REG_MOTOR_CURRENT_A: [u8; 3] = [0x63, 0x8B, 0x00];
const REG_WATER_IN_DC: [u8; 3] = [0x0D, 0x8F, 0x00];
const REG_WATER_OUT_DC: [u8; 3] = [0x0D, 0x8F, 0x01];
const REG_HELIUM_DC: [u8; 3] = [0x0D, 0x8F, 0x02];
const REG_OIL_DC: [u8; 3] = [0x0D, 0x8F, 0x03];
// TODO: confirm the low-side register; the panel map lists 0xAA,0x50 for
// both instantaneous pressures.
const REG_PRES_HIGH_DPSI: [u8; 3] = [0xAA, 0x50, 0x00];
const REG_PRES_LOW_DPSI: [u8; 3] = [0xAA, 0x50, 0x00];
const REG_AVG_PRES_LOW_DPSI: [u8; 3] = [0xBB, 0x94, 0x00];
const REG_AVG_PRES_HIGH_DPSI: [u8; 3] = [0x7E, 0x90, 0x00];
const REG_AVG_PRES_DELTA_DPSI: [u8; 3] = [0x31, 0x9C, 0x00];
const REG_AVG_BOUNCE_DPSI: [u8; 3] = [0x66, 0xFA, 0x00];
const REG_STATE: [u8; 3] = [0x5F, 0x95, 0x00];

/// Upload name, register, scale applied to the raw register value.
const UPLOAD_FIELDS: [(&str, [u8; 3], f64); 9] = [
    ("Bounce", REG_AVG_BOUNCE_DPSI, 0.1),
    ("Current", REG_MOTOR_CURRENT_A, 1.0),
    ("Delta", REG_AVG_PRES_DELTA_DPSI, 0.1),
    ("Helium", REG_HELIUM_DC, 0.1),
    ("High", REG_AVG_PRES_HIGH_DPSI, 0.1),
    ("Low", REG_AVG_PRES_LOW_DPSI, 0.1),
    ("Oil", REG_OIL_DC, 0.1),
    ("WaterIn", REG_WATER_IN_DC, 0.1),
    ("WaterOut", REG_WATER_OUT_DC, 0.1),
];

fn checksum(payload: &[u8]) -> [u8; 2] {
    let sum = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    [(sum >> 4) + 0x40, (sum & 0x0F) + 0x40]
}

fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    for &b in payload {
        match b {
            STX => out.extend([ESC, 0x30]),
            CR => out.extend([ESC, 0x31]),
            ESC => out.extend([ESC, 0x32]),
            _ => out.push(b),
        }
    }
    out
}

fn unstuff(data: &[u8]) -> Result<Vec<u8>> {
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
            other => {
                return Err(
                    InstrumentError::Protocol(format!("bad escape sequence 0x07 {other:?}")).into(),
                );
            }
        }
    }
    Ok(out)
}

/// Wrap an unstuffed payload for the wire.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(STX);
    out.extend(stuff(payload));
    out.extend(checksum(payload));
    out.push(CR);
    out
}

/// Strip framing, undo stuffing and verify the checksum.
fn deframe(packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < 4 {
        return Err(
            InstrumentError::Protocol(format!("short packet ({} bytes)", packet.len())).into(),
        );
    }
    if packet[0] != STX || packet[packet.len() - 1] != CR {
        return Err(InstrumentError::Protocol("missing packet framing".into()).into());
    }
    let inner = &packet[1..packet.len() - 1];
    let (stuffed, check) = inner.split_at(inner.len() - 2);
    let payload = unstuff(stuffed)?;
    if checksum(&payload) != [check[0], check[1]] {
        return Err(InstrumentError::Checksum.into());
    }
    Ok(payload)
}

/// Driver for the first-generation CPA control panel.
pub struct CryomechV1<T> {
    transport: T,
    address: u8,
    seq: u8,
}

impl<T: Transport> CryomechV1<T> {
    pub fn new(transport: T, address: u8) -> Self {
        Self {
            transport,
            address,
            seq: 0x10,
        }
    }

    /// Read one register as the panel's raw signed value.
    ///
    /// The sequence number must echo back exactly; a mismatch means request
    /// and reply have drifted out of step and the connection is unusable.
    pub fn query(&mut self, reg: [u8; 3]) -> Result<i32> {
        let cmd = [
            self.address,
            HOST_ADDR,
            CMD_READ,
            reg[0],
            reg[1],
            reg[2],
            self.seq,
        ];
        self.transport.send(&frame(&cmd)).map_err(io_err)?;
        let raw = self.transport.recv_until(CR, IO_TIMEOUT).map_err(io_err)?;
        let payload = deframe(&raw)?;
        if payload.len() != 11 {
            return Err(InstrumentError::Protocol(format!(
                "reply payload is {} bytes, expected 11",
                payload.len()
            ))
            .into());
        }
        let value = i32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);
        let echo = payload[10];
        if echo != self.seq {
            return Err(InstrumentError::SequenceMismatch {
                sent: self.seq,
                got: echo,
            }
            .into());
        }
        self.seq = if self.seq == 0xFF { 0x10 } else { self.seq + 1 };
        Ok(value)
    }

    fn read_scaled(&mut self, reg: [u8; 3], scale: f64) -> Result<f64> {
        Ok(f64::from(self.query(reg)?) * scale)
    }

    /// Hours the compressor has run since the panel was commissioned.
    pub fn run_time_hours(&mut self) -> Result<f64> {
        Ok(f64::from(self.query(REG_RUNTIME_MIN)?) / 60.0)
    }

    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.query(REG_STATE)? != 0)
    }

    /// Instantaneous low-side pressure in PSI.
    pub fn low_pressure(&mut self) -> Result<f64> {
        self.read_scaled(REG_PRES_LOW_DPSI, 0.1)
    }

    /// Instantaneous high-side pressure in PSI.
    pub fn high_pressure(&mut self) -> Result<f64> {
        self.read_scaled(REG_PRES_HIGH_DPSI, 0.1)
    }
}

pub struct CryomechMonitor {
    client: UploadClient,
    wall: Arc<dyn WallClock>,
    connect: TransportFactory,
    conn: Option<CryomechV1<Box<dyn Transport + Send>>>,
    interval: chrono::Duration,
    address: u8,
    /// Pressure history for the locally computed bounce estimate.
    low: Option<BounceWindow>,
    high: Option<BounceWindow>,
}

impl CryomechMonitor {
    pub fn new(
        cfg: &CryomechCfg,
        upload: &UploadCfg,
        connect: TransportFactory,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        if cfg.version != "v1" {
            eyre::bail!("unsupported compressor version '{}'", cfg.version);
        }
        let mut client = UploadClient::new(upload, cfg.supp.clone(), Arc::clone(&wall))?;
        client.seed_latest()?;
        let (low, high) = if cfg.use_calculated_bounce {
            (
                Some(BounceWindow::new(cfg.compressor_bounce_n)),
                Some(BounceWindow::new(cfg.compressor_bounce_n)),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            client,
            wall,
            connect,
            conn: None,
            interval: chrono::Duration::milliseconds((cfg.interval_s * 1000.0) as i64),
            address: cfg.compressor_address,
            low,
            high,
        })
    }

    fn open(&mut self) -> Result<CryomechV1<Box<dyn Transport + Send>>> {
        let transport = (self.connect)()?;
        let mut panel = CryomechV1::new(transport, self.address);
        let runtime = panel.run_time_hours()?;
        tracing::info!(runtime_h = format!("{runtime:.1}"), "connected to compressor");
        Ok(panel)
    }

    fn read_fields(&mut self, batch: &mut Batch) -> Result<()> {
        let Some(panel) = self.conn.as_mut() else {
            return Err(InstrumentError::Io("not connected".into()).into());
        };
        for (field, reg, scale) in UPLOAD_FIELDS {
            batch.insert(field, panel.read_scaled(reg, scale)?);
        }
        if let (Some(low), Some(high)) = (self.low.as_mut(), self.high.as_mut()) {
            low.push(panel.low_pressure()?);
            high.push(panel.high_pressure()?);
            // The estimate needs a full window; until then the panel's own
            // register stands.
            if let (Some(l), Some(h)) = (low.amplitude(), high.amplitude()) {
                batch.insert("Bounce", (l + h) / 2.0);
            }
        }
        Ok(())
    }
}

impl Poller for CryomechMonitor {
    fn name(&self) -> &str {
        "cryomech"
    }

    fn poll(&mut self) -> Result<Progress> {
        if self.conn.is_none() {
            let panel = self.open()?;
            self.conn = Some(panel);
            // A reconnect gap would read as a pressure swing; start the
            // history over.
            if let Some(w) = self.low.as_mut() {
                w.clear();
            }
            if let Some(w) = self.high.as_mut() {
                w.clear();
            }
        }
        let now = self.wall.now();
        if !upload_due(now, self.client.latest(), self.interval) {
            return Ok(Progress::Idle);
        }
        let mut batch = Batch::new(now);
        if let Err(e) = self.read_fields(&mut batch) {
            tracing::error!(
                error = format!("{e:#}"),
                "communication with the compressor failed, reconnecting next tick"
            );
            self.conn = None;
            return Err(e);
        }
        self.client.upload(&batch)?;
        Ok(Progress::Advanced)
    }
}
