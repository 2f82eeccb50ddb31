//! Lakeshore Model 336 temperature controller.
//!
//! Plain line protocol: commands end in `\n`, replies in `\r\n`. Each
//! configured input (A..D) is read with `KRDG?` and uploaded in Kelvin, or
//! millikelvin when the fridge's dashboard expects it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cryomon_config::{LakeshoreCfg, UploadCfg};
use cryomon_traits::Transport;

use crate::error::{InstrumentError, Result};
use crate::instruments::{TransportFactory, io_err, upload_due};
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Substring every 336 reports in `*IDN?`; anything else means the port is
/// wired to some other box.
const IDN_TAG: &str = "LSCI,MODEL336";

fn query(conn: &mut (dyn Transport + Send), cmd: &str) -> Result<String> {
    conn.send(format!("{cmd}\n").as_bytes()).map_err(io_err)?;
    let raw = conn.recv_until(b'\n', IO_TIMEOUT).map_err(io_err)?;
    Ok(String::from_utf8_lossy(&raw)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

pub struct Lakeshore336Monitor {
    client: UploadClient,
    wall: Arc<dyn WallClock>,
    connect: TransportFactory,
    conn: Option<Box<dyn Transport + Send>>,
    /// Input letter -> sensor name.
    sensors: BTreeMap<String, String>,
    interval: chrono::Duration,
    millikelvin: bool,
}

impl Lakeshore336Monitor {
    pub fn new(
        cfg: &LakeshoreCfg,
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
            millikelvin: cfg.upload_millikelvin,
        })
    }

    fn open(&mut self) -> Result<Box<dyn Transport + Send>> {
        let mut conn = (self.connect)()?;
        let idn = query(conn.as_mut(), "*IDN?")?;
        if !idn.contains(IDN_TAG) {
            return Err(
                InstrumentError::Protocol(format!("unexpected identification: {idn}")).into(),
            );
        }
        tracing::info!(%idn, "connected to Lakeshore 336");
        Ok(conn)
    }

    fn read_inputs(&mut self, batch: &mut Batch) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(InstrumentError::Io("not connected".into()).into());
        };
        for (input, sensor) in &self.sensors {
            let reply = query(conn.as_mut(), &format!("KRDG? {input}"))?;
            match reply.trim().trim_end_matches(';').parse::<f64>() {
                Ok(kelvin) => {
                    let value = if self.millikelvin {
                        kelvin * 1000.0
                    } else {
                        kelvin
                    };
                    batch.insert(sensor.clone(), value);
                }
                Err(_) => tracing::warn!(%sensor, %reply, "unparseable temperature reading"),
            }
        }
        Ok(())
    }
}

impl Poller for Lakeshore336Monitor {
    fn name(&self) -> &str {
        "lakeshore336"
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
        if let Err(e) = self.read_inputs(&mut batch) {
            tracing::error!(
                error = format!("{e:#}"),
                "communication with the 336 failed, reconnecting next tick"
            );
            self.conn = None;
            return Err(e);
        }
        self.client.upload(&batch)?;
        Ok(Progress::Advanced)
    }
}
