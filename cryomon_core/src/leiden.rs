//! Leiden fridge log monitor.
//!
//! The Leiden TC software appends tab-separated readings to one file per
//! logging run; the run's start time is embedded in the file name, so a
//! restart of the fridge software shows up as a newer file in the same flat
//! directory. The monitor tails the newest file and, while idle, checks for
//! a successor every few minutes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;

use cryomon_config::{LeidenCfg, UploadCfg};
use cryomon_traits::Clock;

use crate::error::Result;
use crate::logtail::TailReader;
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

/// Timestamp layout in column 0 of every Leiden line.
pub const LEIDEN_STAMP: &str = "%Y-%m-%d %H:%M:%S";
/// Timestamp layout captured from the log file name.
const FILE_STAMP: &str = "%Y-%m-%d-%H-%M-%S";

const LOG_WARN_INTERVAL: Duration = Duration::from_secs(1800);

/// Newest matching log file in `dir`, by the timestamp the file name carries
/// (ties broken by name). An empty directory is an error; the caller's retry
/// policy covers a fridge whose software has not started logging yet.
fn find_latest_log(dir: &Path, pattern: &Regex) -> Result<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| eyre::eyre!("reading log directory {}: {e}", dir.display()))?;
    let mut newest: Option<(NaiveDateTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| eyre::eyre!("reading log directory {}: {e}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stamp) = pattern.captures(name).and_then(|c| c.get(1)) else {
            continue;
        };
        let Ok(started) = NaiveDateTime::parse_from_str(stamp.as_str(), FILE_STAMP) else {
            tracing::warn!(file = name, "log file name timestamp does not parse; ignoring it");
            continue;
        };
        let candidate = (started, entry.path());
        if newest.as_ref().is_none_or(|best| candidate > *best) {
            newest = Some(candidate);
        }
    }
    newest.map(|(_, path)| path).ok_or_else(|| {
        eyre::eyre!(
            "no log files matching {} in {}",
            pattern.as_str(),
            dir.display()
        )
    })
}

pub struct LeidenTempMonitor {
    client: UploadClient,
    clock: Arc<dyn Clock + Send + Sync>,
    wall: Arc<dyn WallClock>,
    log_dir: PathBuf,
    pattern: Regex,
    /// Sensor name → tab-separated column (column 0 is the timestamp).
    sensors: BTreeMap<String, usize>,
    interval: Duration,
    check_interval: chrono::Duration,
    tail: TailReader,
    last_check: NaiveDateTime,
}

impl LeidenTempMonitor {
    pub fn new(
        cfg: &LeidenCfg,
        upload: &UploadCfg,
        clock: Arc<dyn Clock + Send + Sync>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let log_dir = PathBuf::from(&cfg.log_dir);
        if !log_dir.is_dir() {
            eyre::bail!("log directory {} does not exist", log_dir.display());
        }
        let pattern = Regex::new(&cfg.file_pattern)
            .map_err(|e| eyre::eyre!("invalid file_pattern {:?}: {e}", cfg.file_pattern))?;
        let mut client = UploadClient::new(upload, None, wall.clone())?;
        client.seed_latest()?;

        let current = find_latest_log(&log_dir, &pattern)?;
        tracing::info!(file = %current.display(), "following Leiden log");
        let tail = TailReader::new(current, clock.clone(), LOG_WARN_INTERVAL);
        let last_check = wall.now();
        Ok(Self {
            client,
            clock,
            wall,
            log_dir,
            pattern,
            sensors: cfg.sensors.clone(),
            interval: Duration::from_secs_f64(cfg.interval_s),
            check_interval: chrono::Duration::milliseconds(
                (cfg.new_log_check_interval_s * 1000.0) as i64,
            ),
            tail,
            last_check,
        })
    }

    fn next_reading(&mut self) -> Result<Option<(NaiveDateTime, BTreeMap<String, f64>)>> {
        loop {
            let line = self
                .tail
                .next_line()
                .map_err(|e| eyre::eyre!("reading {}: {e}", self.tail.path().display()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if let Some(reading) = self.parse_line(&line) {
                return Ok(Some(reading));
            }
        }
    }

    fn parse_line(&self, line: &str) -> Option<(NaiveDateTime, BTreeMap<String, f64>)> {
        let fields: Vec<&str> = line.split('\t').collect();
        let stamp = fields.first().map(|s| s.trim()).unwrap_or_default();
        let Ok(time) = NaiveDateTime::parse_from_str(stamp, LEIDEN_STAMP) else {
            tracing::warn!(
                file = %self.tail.path().display(),
                line,
                "skipping line with unparseable timestamp"
            );
            return None;
        };
        let mut values = BTreeMap::new();
        for (sensor, column) in &self.sensors {
            match fields.get(*column) {
                Some(raw) => match raw.trim().parse::<f64>() {
                    Ok(v) => {
                        values.insert(sensor.clone(), v);
                    }
                    Err(_) => {
                        tracing::warn!(sensor, value = raw.trim(), "unparseable sensor value");
                    }
                },
                None => {
                    tracing::warn!(sensor, column, "line has too few columns for sensor");
                }
            }
        }
        Some((time, values))
    }

    /// Look for a newer log file, remembering when we last looked.
    fn check_for_new_log(&mut self) -> Result<Progress> {
        let newest = find_latest_log(&self.log_dir, &self.pattern)?;
        if newest == *self.tail.path() {
            return Ok(Progress::Idle);
        }
        tracing::info!(file = %newest.display(), "logging restarted; following new file");
        self.tail = TailReader::new(newest, self.clock.clone(), LOG_WARN_INTERVAL);
        Ok(Progress::Advanced)
    }
}

impl Poller for LeidenTempMonitor {
    fn name(&self) -> &str {
        "leiden"
    }

    fn poll(&mut self) -> Result<Progress> {
        if let Some((time, values)) = self.next_reading()? {
            if time < self.client.latest() {
                tracing::debug!(%time, "dropping reading already on the server");
                return Ok(Progress::Advanced);
            }
            let mut batch = Batch::new(time);
            for (sensor, value) in values {
                batch.insert(sensor, value);
            }
            self.client.upload(&batch)?;
            return Ok(Progress::Advanced);
        }

        let now = self.wall.now();
        if now - self.last_check >= self.check_interval {
            self.last_check = now;
            return self.check_for_new_log();
        }
        Ok(Progress::Idle)
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
