//! BlueFors log-directory monitors.
//!
//! BlueFors control software writes one folder of log files per day, named
//! `yy-mm-dd`. Inside it every temperature channel gets its own file, the
//! compressor appends to a status file and the MaxiGauge to a pressure file.
//! One composite poller drives a temperature monitor, zero or more compressor
//! monitors and a gauge monitor over the same folder, each with its own
//! upload stream.

mod compressor;
mod maxigauge;
mod temperature;

pub use compressor::CompressorMonitor;
pub use maxigauge::MaxiGaugeLogMonitor;
pub use temperature::{SensorReading, TempMonitor};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use cryomon_config::{BlueForsCfg, UploadCfg};
use cryomon_traits::Clock;

use crate::error::Result;
use crate::time::WallClock;
use crate::{Poller, Progress};

/// Day-folder naming, e.g. `25-08-22`.
pub(crate) const FOLDER_FORMAT: &str = "%y-%m-%d";

/// `yy-mm-dd` prefix check for a folder name.
fn is_day_folder(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 8
        && bytes[..8].iter().enumerate().all(|(i, b)| match i {
            2 | 5 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// The folder BlueFors is writing to: today's if it exists, otherwise the
/// newest dated folder under `root`. A log root with no dated folders at all
/// is an error.
pub(crate) fn latest_folder(root: &Path, today: NaiveDate) -> Result<PathBuf> {
    let today_dir = root.join(today.format(FOLDER_FORMAT).to_string());
    if today_dir.exists() {
        return Ok(today_dir);
    }

    let entries = std::fs::read_dir(root)
        .map_err(|e| eyre::eyre!("reading log directory {}: {e}", root.display()))?;
    let mut newest: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry =
            entry.map_err(|e| eyre::eyre!("reading log directory {}: {e}", root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // Zero-padded dates sort correctly as strings.
        if is_day_folder(name) && newest.as_ref().is_none_or(|(best, _)| name > best.as_str()) {
            newest = Some((name.to_string(), entry.path()));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| eyre::eyre!("no dated log folders in {}", root.display()))
}

/// Name of the current day folder, for building file names inside it.
pub(crate) fn day_name(cwd: &Path) -> String {
    cwd.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Day-rollover check shared by the monitors: once the current folder is no
/// longer today's, re-run discovery and report the new folder if it moved.
pub(crate) fn advance_day_folder(
    log_dir: &Path,
    cwd: &Path,
    wall: &dyn WallClock,
) -> Result<Option<PathBuf>> {
    let today = wall.today().format(FOLDER_FORMAT).to_string();
    if day_name(cwd) == today {
        return Ok(None);
    }
    let latest = latest_folder(log_dir, wall.today())?;
    if latest == cwd {
        return Ok(None);
    }
    tracing::info!(folder = %latest.display(), "advancing log folder");
    Ok(Some(latest))
}

/// All monitors configured for one BlueFors fridge, polled as a unit.
pub struct BlueForsMonitor {
    children: Vec<Box<dyn Poller>>,
    interval: Duration,
}

impl BlueForsMonitor {
    pub fn new(
        cfg: &BlueForsCfg,
        upload: &UploadCfg,
        clock: Arc<dyn Clock + Send + Sync>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let log_dir = PathBuf::from(&cfg.log_dir);
        if !log_dir.exists() {
            tracing::error!(dir = %log_dir.display(), "log directory does not exist");
            eyre::bail!("log directory {} does not exist", log_dir.display());
        }
        if !log_dir.is_dir() {
            eyre::bail!("log path {} is not a directory", log_dir.display());
        }

        let mut children: Vec<Box<dyn Poller>> = Vec::new();
        children.push(Box::new(TempMonitor::new(
            cfg,
            upload,
            clock.clone(),
            wall.clone(),
        )?));

        if cfg.upload_compressors {
            match cfg.num_compressors {
                Some(n) if n > 1 => {
                    for num in 1..=n {
                        children.push(Box::new(CompressorMonitor::new(
                            cfg,
                            upload,
                            Some(num),
                            clock.clone(),
                            wall.clone(),
                        )?));
                    }
                }
                _ => children.push(Box::new(CompressorMonitor::new(
                    cfg,
                    upload,
                    None,
                    clock.clone(),
                    wall.clone(),
                )?)),
            }
        }

        if cfg.upload_maxigauge {
            children.push(Box::new(MaxiGaugeLogMonitor::new(
                cfg,
                upload,
                clock.clone(),
                wall.clone(),
            )?));
        }

        Ok(Self {
            children,
            interval: Duration::from_secs_f64(cfg.interval_s),
        })
    }
}

impl Poller for BlueForsMonitor {
    fn name(&self) -> &str {
        "bluefors"
    }

    fn poll(&mut self) -> Result<Progress> {
        let mut progress = Progress::Idle;
        for child in &mut self.children {
            if child.poll()?.advanced() {
                progress = Progress::Advanced;
            }
        }
        Ok(progress)
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
