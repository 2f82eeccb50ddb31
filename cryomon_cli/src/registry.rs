//! Turns the config's uploader roster into supervisor-ready factories.
//!
//! Each enabled `[[uploader]]` becomes one [`PollerFactory`]. A factory owns
//! everything needed to rebuild its poller from scratch, so a restart after a
//! crash reconnects and reseeds instead of resuming a poisoned session.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::Result;

use cryomon_config::{Avs47Cfg, CalibrationCurve, Config, UploaderCfg};
use cryomon_core::Poller;
use cryomon_core::bluefors::BlueForsMonitor;
use cryomon_core::instruments::{
    Avs47Monitor, CryomechMonitor, Lakeshore336Monitor, MaxiGaugeMonitor, PortFactory,
    SampleMonitor, TransportFactory,
};
use cryomon_core::leiden::LeidenTempMonitor;
use cryomon_core::scheduler::PollerFactory;
use cryomon_core::time::{SystemWallClock, WallClock};
use cryomon_hardware::TcpTransport;
#[cfg(feature = "serial")]
use cryomon_hardware::{SerialHandshake, SerialTransport};
#[cfg(not(feature = "serial"))]
use cryomon_hardware::{SimAvs47, SimCryomech, SimLakeshore336, SimMaxiGauge};
use cryomon_traits::{Clock, HandshakePort, MonotonicClock, Transport};

/// The 336 front panel's factory setting.
const LAKESHORE_DEFAULT_BAUD: u32 = 57_600;

/// One factory per enabled uploader, in config order. Disabled entries are
/// logged and skipped; the supervisor complains if nothing is left.
pub fn build_factories(cfg: &Config) -> Result<Vec<PollerFactory>> {
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(MonotonicClock::new());
    let wall: Arc<dyn WallClock> = Arc::new(SystemWallClock);

    let mut factories = Vec::new();
    for up in &cfg.uploaders {
        if !up.enabled() {
            tracing::info!(uploader = up.kind(), "disabled in config, skipping");
            continue;
        }
        factories.push(factory_for(up, cfg, &clock, &wall)?);
    }
    Ok(factories)
}

fn factory_for(
    up: &UploaderCfg,
    cfg: &Config,
    clock: &Arc<dyn Clock + Send + Sync>,
    wall: &Arc<dyn WallClock>,
) -> Result<PollerFactory> {
    let upload = cfg.upload.clone();
    Ok(match up {
        UploaderCfg::Sample(c) => {
            let c = c.clone();
            let wall = Arc::clone(wall);
            Box::new(move || {
                let poller: Box<dyn Poller> =
                    Box::new(SampleMonitor::new(&c, &upload, Arc::clone(&wall))?);
                Ok(poller)
            })
        }
        UploaderCfg::BlueFors(c) => {
            let c = c.clone();
            let clock = Arc::clone(clock);
            let wall = Arc::clone(wall);
            Box::new(move || {
                let poller: Box<dyn Poller> = Box::new(BlueForsMonitor::new(
                    &c,
                    &upload,
                    Arc::clone(&clock),
                    Arc::clone(&wall),
                )?);
                Ok(poller)
            })
        }
        UploaderCfg::Leiden(c) => {
            let c = c.clone();
            let clock = Arc::clone(clock);
            let wall = Arc::clone(wall);
            Box::new(move || {
                let poller: Box<dyn Poller> = Box::new(LeidenTempMonitor::new(
                    &c,
                    &upload,
                    Arc::clone(&clock),
                    Arc::clone(&wall),
                )?);
                Ok(poller)
            })
        }
        UploaderCfg::Avs47(c) => {
            let curves = resolve_curves(c, cfg)?;
            let c = c.clone();
            let clock = Arc::clone(clock);
            let wall = Arc::clone(wall);
            Box::new(move || {
                let poller: Box<dyn Poller> = Box::new(Avs47Monitor::new(
                    &c,
                    &upload,
                    &curves,
                    bridge_port(&c.port, c.address),
                    Arc::clone(&wall),
                    Arc::clone(&clock),
                )?);
                Ok(poller)
            })
        }
        UploaderCfg::Lakeshore336(c) => {
            let c = c.clone();
            let wall = Arc::clone(wall);
            Box::new(move || {
                let connect = transport_factory(
                    &c.address,
                    c.baud.unwrap_or(LAKESHORE_DEFAULT_BAUD),
                    SimKind::Lakeshore,
                );
                let poller: Box<dyn Poller> = Box::new(Lakeshore336Monitor::new(
                    &c,
                    &upload,
                    connect,
                    Arc::clone(&wall),
                )?);
                Ok(poller)
            })
        }
        UploaderCfg::Cryomech(c) => {
            let c = c.clone();
            let wall = Arc::clone(wall);
            Box::new(move || {
                let connect = transport_factory(
                    &c.address,
                    c.baud.unwrap_or(115_200),
                    SimKind::Cryomech {
                        address: c.compressor_address,
                    },
                );
                let poller: Box<dyn Poller> =
                    Box::new(CryomechMonitor::new(&c, &upload, connect, Arc::clone(&wall))?);
                Ok(poller)
            })
        }
        UploaderCfg::MaxiGauge(c) => {
            let c = c.clone();
            let wall = Arc::clone(wall);
            Box::new(move || {
                let connect =
                    transport_factory(&c.address, c.baud.unwrap_or(9600), SimKind::MaxiGauge);
                let poller: Box<dyn Poller> =
                    Box::new(MaxiGaugeMonitor::new(&c, &upload, connect, Arc::clone(&wall))?);
                Ok(poller)
            })
        }
    })
}

/// Curves referenced by the enabled bridge channels, resolved against
/// `[calibration]` overrides and the built-ins.
fn resolve_curves(cfg: &Avs47Cfg, root: &Config) -> Result<BTreeMap<String, CalibrationCurve>> {
    let mut curves = BTreeMap::new();
    for (ch, channel) in &cfg.channels {
        if !channel.enabled || curves.contains_key(&channel.calibration) {
            continue;
        }
        let curve = root.curve(&channel.calibration).ok_or_else(|| {
            eyre::eyre!("channel {ch}: unknown calibration '{}'", channel.calibration)
        })?;
        curves.insert(channel.calibration.clone(), curve);
    }
    Ok(curves)
}

/// Which simulated instrument stands in for a serial device when the
/// `serial` feature is off.
#[derive(Clone, Copy)]
enum SimKind {
    Lakeshore,
    Cryomech { address: u8 },
    MaxiGauge,
}

/// `tcp://host:port` opens a socket; anything else is a serial device path.
fn transport_factory(address: &str, baud: u32, sim: SimKind) -> TransportFactory {
    let address = address.to_string();
    Box::new(move || connect_transport(&address, baud, sim))
}

fn connect_transport(address: &str, baud: u32, sim: SimKind) -> Result<Box<dyn Transport + Send>> {
    if let Some(hostport) = address.strip_prefix("tcp://") {
        let conn: Box<dyn Transport + Send> = Box::new(TcpTransport::connect(hostport)?);
        return Ok(conn);
    }
    open_serial(address, baud, sim)
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud: u32, _sim: SimKind) -> Result<Box<dyn Transport + Send>> {
    Ok(Box::new(SerialTransport::open(path, baud)?))
}

/// Without the `serial` feature a device path gets a simulated instrument,
/// which keeps a machine with no ports usable end to end (with `--mock` for
/// the upload side).
#[cfg(not(feature = "serial"))]
fn open_serial(path: &str, _baud: u32, sim: SimKind) -> Result<Box<dyn Transport + Send>> {
    tracing::warn!(%path, "serial support not compiled in; using a simulated instrument");
    Ok(match sim {
        SimKind::Lakeshore => Box::new(SimLakeshore336::new()),
        SimKind::Cryomech { address } => Box::new(SimCryomech::new(address)),
        SimKind::MaxiGauge => Box::new(SimMaxiGauge::new()),
    })
}

fn bridge_port(path: &str, address: u8) -> PortFactory {
    let path = path.to_string();
    Box::new(move || open_bridge(&path, address))
}

#[cfg(feature = "serial")]
fn open_bridge(path: &str, _address: u8) -> Result<Box<dyn HandshakePort + Send>> {
    Ok(Box::new(SerialHandshake::open(path)?))
}

#[cfg(not(feature = "serial"))]
fn open_bridge(path: &str, address: u8) -> Result<Box<dyn HandshakePort + Send>> {
    tracing::warn!(%path, "serial support not compiled in; using a simulated bridge");
    Ok(Box::new(SimAvs47::new(address)))
}
