//! Pfeiffer MaxiGauge pressure controller, read over its own serial line.
//!
//! The gauge speaks an ACK/ENQ dance: every command is answered with a
//! three-byte acknowledgement (`ACK \r\n` or `NAK \r\n`), and the actual
//! reply only comes once the host sends ENQ. Readings arrive as
//! `status,value`; only status 0 carries a usable pressure.
//!
//! Fridges whose gauge lines end up in the BlueFors log instead are covered
//! by the log-tailing monitor; this poller is for a gauge wired straight to
//! the monitoring host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cryomon_config::{MaxiGaugeCfg, UploadCfg};
use cryomon_traits::Transport;

use crate::error::{InstrumentError, Result};
use crate::instruments::{TransportFactory, io_err, upload_due};
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const ENQ: u8 = 0x05;

fn query(conn: &mut (dyn Transport + Send), cmd: &str) -> Result<String> {
    conn.send(format!("{cmd}\r\n").as_bytes()).map_err(io_err)?;
    let ack = conn.recv_exact(3, IO_TIMEOUT).map_err(io_err)?;
    match ack.first() {
        Some(&ACK) => {}
        Some(&NAK) => return Err(InstrumentError::Nak.into()),
        other => {
            return Err(InstrumentError::Protocol(format!(
                "unexpected handshake byte {other:?} to {cmd:?}"
            ))
            .into());
        }
    }
    conn.send(&[ENQ]).map_err(io_err)?;
    let raw = conn.recv_until(b'\n', IO_TIMEOUT).map_err(io_err)?;
    Ok(String::from_utf8_lossy(&raw)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

pub struct MaxiGaugeMonitor {
    client: UploadClient,
    wall: Arc<dyn WallClock>,
    connect: TransportFactory,
    conn: Option<Box<dyn Transport + Send>>,
    /// Gauge channel (1..=6) -> sensor name.
    sensors: BTreeMap<u8, String>,
    interval: chrono::Duration,
}

impl MaxiGaugeMonitor {
    pub fn new(
        cfg: &MaxiGaugeCfg,
        upload: &UploadCfg,
        connect: TransportFactory,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let mut client = UploadClient::new(upload, cfg.supp.clone(), Arc::clone(&wall))?;
        client.seed_latest()?;
        Ok(Self {
            client,
            wall,
            connect,
            conn: None,
            sensors: cfg.sensors.clone(),
            interval: chrono::Duration::milliseconds((cfg.interval_s * 1000.0) as i64),
        })
    }

    fn open(&mut self) -> Result<Box<dyn Transport + Send>> {
        let mut conn = (self.connect)()?;
        let gauges = query(conn.as_mut(), "CID")?;
        tracing::info!(%gauges, "connected to MaxiGauge");
        Ok(conn)
    }

    fn read_channels(&mut self, batch: &mut Batch) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(InstrumentError::Io("not connected".into()).into());
        };
        for (channel, sensor) in &self.sensors {
            let reply = query(conn.as_mut(), &format!("PR{channel}"))?;
            let Some((status_str, value_str)) = reply.split_once(',') else {
                tracing::warn!(%sensor, %reply, "malformed gauge reply");
                continue;
            };
            let (Ok(status), Ok(value)) = (
                status_str.trim().parse::<i64>(),
                value_str.trim().parse::<f64>(),
            ) else {
                tracing::warn!(%sensor, %reply, "unparseable gauge reply");
                continue;
            };
            match status {
                0 => {
                    batch.insert(sensor.clone(), value);
                }
                1 | 2 => tracing::debug!(%sensor, status, "gauge out of range"),
                3..=6 => tracing::warn!(%sensor, status, "gauge sensor error"),
                _ => tracing::warn!(%sensor, status, "unknown gauge status"),
            }
        }
        Ok(())
    }
}

impl Poller for MaxiGaugeMonitor {
    fn name(&self) -> &str {
        "maxigauge"
    }

    fn poll(&mut self) -> Result<Progress> {
        if self.conn.is_none() {
            self.conn = Some(self.open()?);
        }
        let now = self.wall.now();
        if !upload_due(now, self.client.latest(), self.interval) {
            return Ok(Progress::Idle);
        }
        let mut batch = Batch::new(now);
        if let Err(e) = self.read_channels(&mut batch) {
            tracing::error!(
                error = format!("{e:#}"),
                "communication with the MaxiGauge failed, reconnecting next tick"
            );
            self.conn = None;
            return Err(e);
        }
        self.client.upload(&batch)?;
        Ok(Progress::Advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ManualWallClock, ScriptedTransport};
    use chrono::NaiveDate;

    fn noon() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn factory(script: &ScriptedTransport) -> TransportFactory {
        let script = script.clone();
        Box::new(move || {
            let conn: Box<dyn Transport + Send> = Box::new(script.clone());
            Ok(conn)
        })
    }

    fn monitor(
        script: &ScriptedTransport,
        wall: &Arc<ManualWallClock>,
        sensors: BTreeMap<u8, String>,
    ) -> MaxiGaugeMonitor {
        let upload = UploadCfg {
            mock: true,
            fridge: "Fridge".into(),
            ..UploadCfg::default()
        };
        let cfg = MaxiGaugeCfg {
            enabled: true,
            supp: Some("MaxiGauge".into()),
            address: "/dev/ttyUSB1".into(),
            baud: Some(9600),
            interval_s: 30.0,
            sensors,
        };
        let wall: Arc<dyn WallClock> = wall.clone();
        MaxiGaugeMonitor::new(&cfg, &upload, factory(script), wall).unwrap()
    }

    fn accept(script: &ScriptedTransport, reply: &str) {
        script.push_reply(&[ACK, b'\r', b'\n']);
        script.push_reply(reply.as_bytes());
    }

    #[test]
    fn handshakes_with_ack_then_enq() {
        let script = ScriptedTransport::new();
        accept(&script, "PKR,PKR,NON,NON,NON,NON\r\n");
        accept(&script, "0, 9.2900E-03\r\n");
        let wall = Arc::new(ManualWallClock::new(noon()));
        let mut mon = monitor(&script, &wall, [(3u8, "OVC".to_string())].into());

        wall.advance(chrono::Duration::seconds(31));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);

        assert_eq!(
            script.sent(),
            vec![
                b"CID\r\n".to_vec(),
                vec![ENQ],
                b"PR3\r\n".to_vec(),
                vec![ENQ],
            ]
        );
        let sent = mon.client.mock_sent();
        assert_eq!(sent[0].values["OVC"], 9.29e-3);
        assert_eq!(sent[0].time, noon() + chrono::Duration::seconds(31));
    }

    #[test]
    fn idle_inside_the_interval_after_connecting() {
        let script = ScriptedTransport::new();
        accept(&script, "PKR,PKR,NON,NON,NON,NON\r\n");
        let wall = Arc::new(ManualWallClock::new(noon()));
        let mut mon = monitor(&script, &wall, [(3u8, "OVC".to_string())].into());

        assert_eq!(mon.poll().unwrap(), Progress::Idle);
        assert_eq!(script.sent().len(), 2); // CID + ENQ only
    }

    #[test]
    fn a_nak_fails_the_tick_and_drops_the_connection() {
        let script = ScriptedTransport::new();
        accept(&script, "PKR,PKR,NON,NON,NON,NON\r\n");
        script.push_reply(&[NAK, b'\r', b'\n']);
        let wall = Arc::new(ManualWallClock::new(noon()));
        let mut mon = monitor(&script, &wall, [(3u8, "OVC".to_string())].into());

        wall.advance(chrono::Duration::seconds(31));
        let err = mon.poll().unwrap_err();
        assert!(format!("{err}").contains("NAK"));
        assert!(mon.conn.is_none());
        assert!(mon.client.mock_sent().is_empty());
    }

    #[test]
    fn only_ok_status_channels_are_uploaded() {
        let script = ScriptedTransport::new();
        accept(&script, "PKR,PKR,PKR,PKR,NON,NON\r\n");
        accept(&script, "0,1.0210E+00\r\n"); // ch1 ok
        accept(&script, "5,2.0000E-02\r\n"); // ch2 no sensor
        accept(&script, "3,0.0000E+00\r\n"); // ch3 sensor error
        accept(&script, "nonsense\r\n"); // ch4 garbage
        let wall = Arc::new(ManualWallClock::new(noon()));
        let sensors: BTreeMap<u8, String> = [
            (1u8, "Tank".to_string()),
            (2u8, "Still".to_string()),
            (3u8, "OVC".to_string()),
            (4u8, "IVC".to_string()),
        ]
        .into();
        let mut mon = monitor(&script, &wall, sensors);

        wall.advance(chrono::Duration::seconds(31));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent[0].values.len(), 1);
        assert_eq!(sent[0].values["Tank"], 1.021);
    }
}
