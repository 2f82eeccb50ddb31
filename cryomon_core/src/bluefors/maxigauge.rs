//! MaxiGauge pressure-file monitor.
//!
//! BlueFors dumps the gauge controller's state into `maxigauge {date}.log`
//! as repeating six-field groups: channel id, display name, enabled flag,
//! value, error state and an unused trailer. Only channels that are enabled
//! and error-free are uploaded, to the `MaxiGauge` supplementary stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cryomon_config::{BlueForsCfg, UploadCfg};
use cryomon_traits::Clock;

use super::{advance_day_folder, day_name, latest_folder};
use crate::error::Result;
use crate::logtail::RawCursor;
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

const GAUGE_MAP: [(&str, &str); 6] = [
    ("CH1", "VC"),
    ("CH2", "PStill"),
    ("CH3", "Condensing"),
    ("CH4", "Backing"),
    ("CH5", "Tank"),
    ("CH6", "AirBacking"),
];

fn gauge_key(channel: &str) -> Option<&'static str> {
    GAUGE_MAP
        .iter()
        .find(|(ch, _)| *ch == channel)
        .map(|(_, name)| *name)
}

fn gauge_file(folder: &str) -> String {
    format!("maxigauge {folder}.log")
}

pub struct MaxiGaugeLogMonitor {
    client: UploadClient,
    clock: Arc<dyn Clock + Send + Sync>,
    wall: Arc<dyn WallClock>,
    log_dir: PathBuf,
    warn_interval: Duration,
    cwd: PathBuf,
    status: RawCursor,
}

impl MaxiGaugeLogMonitor {
    pub fn new(
        cfg: &BlueForsCfg,
        upload: &UploadCfg,
        clock: Arc<dyn Clock + Send + Sync>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let mut client = UploadClient::new(upload, Some("MaxiGauge".to_string()), wall.clone())?;
        client.seed_latest()?;

        let log_dir = PathBuf::from(&cfg.log_dir);
        let cwd = latest_folder(&log_dir, wall.today())?;
        let warn_interval = Duration::from_secs_f64(cfg.log_warning_interval_s);
        let status = RawCursor::new(
            cwd.join(gauge_file(&day_name(&cwd))),
            clock.clone(),
            warn_interval,
        );
        Ok(Self {
            client,
            clock,
            wall,
            log_dir,
            warn_interval,
            cwd,
            status,
        })
    }

    fn reopen(&mut self) {
        self.status = RawCursor::new(
            self.cwd.join(gauge_file(&day_name(&self.cwd))),
            self.clock.clone(),
            self.warn_interval,
        );
    }
}

impl Poller for MaxiGaugeLogMonitor {
    fn name(&self) -> &str {
        "bluefors-maxigauge"
    }

    fn poll(&mut self) -> Result<Progress> {
        let next = self
            .status
            .pop()
            .map_err(|e| eyre::eyre!("reading {}: {e}", self.status.path().display()))?;
        if let Some((time, rest)) = next {
            if time < self.client.latest() {
                return Ok(Progress::Advanced);
            }

            let mut batch = Batch::new(time);
            let fields: Vec<&str> = rest.split(',').collect();
            // A trailing partial group means the controller was mid-write;
            // it will come around again on the next full line.
            for group in fields.chunks_exact(6) {
                let channel = group[0].trim();
                let parsed = (
                    group[2].trim().parse::<i64>(),
                    group[3].trim().parse::<f64>(),
                    group[4].trim().parse::<i64>(),
                );
                let (Ok(enabled), Ok(value), Ok(error)) = parsed else {
                    tracing::warn!(channel, "unparseable gauge entry");
                    continue;
                };
                if enabled == 0 || error != 0 {
                    continue;
                }
                match gauge_key(channel) {
                    Some(name) => batch.insert(name, value),
                    None => tracing::warn!(channel, "unknown gauge channel"),
                }
            }

            self.client.upload(&batch)?;
            return Ok(Progress::Advanced);
        }

        match advance_day_folder(&self.log_dir, &self.cwd, self.wall.as_ref())? {
            Some(folder) => {
                self.cwd = folder;
                self.reopen();
                Ok(Progress::Advanced)
            }
            None => Ok(Progress::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FakeClock, ManualWallClock};
    use chrono::{NaiveDate, NaiveDateTime};
    use std::fs;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn upload_cfg() -> UploadCfg {
        UploadCfg {
            mock: true,
            fridge: "BlueFors_LD".into(),
            ..UploadCfg::default()
        }
    }

    fn cfg(dir: &std::path::Path) -> BlueForsCfg {
        BlueForsCfg {
            enabled: true,
            log_dir: dir.to_str().unwrap().to_string(),
            interval_s: 1.0,
            log_warning_interval_s: 1800.0,
            max_age_s: 180.0,
            sensors: [("MC".to_string(), 6u8)].into(),
            upload_compressors: false,
            num_compressors: None,
            compressor_bounce_n: 15,
            upload_maxigauge: true,
        }
    }

    fn monitor(dir: &std::path::Path, wall_at: NaiveDateTime) -> MaxiGaugeLogMonitor {
        let wall: Arc<dyn WallClock> = Arc::new(ManualWallClock::new(wall_at));
        MaxiGaugeLogMonitor::new(&cfg(dir), &upload_cfg(), Arc::new(FakeClock::new()), wall)
            .unwrap()
    }

    #[test]
    fn uploads_enabled_error_free_channels_only() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        fs::write(
            folder.join("maxigauge 25-08-22.log"),
            "22-08-25,14:00:00,\
             CH1,VACCAN ,1, 9.29e-03,0,1,\
             CH2,PSTILL ,1, 1.07e+00,2,1,\
             CH3,COND   ,0, 0.00e+00,0,1,\
             CH4,BACKING,1, 6.1e-01,0,1,\
             CH5,TANK   ,1, junk,0,1,\
             CH6,AIRBACK,1, 7.2e+02,0\n",
        )
        .unwrap();

        let mut mon = monitor(dir.path(), at(13, 0, 0));

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].time, at(14, 0, 0));
        // CH2 errored, CH3 disabled, CH5 unparseable, CH6's group is short.
        assert_eq!(sent[0].values.len(), 2);
        assert_eq!(sent[0].values.get("VC"), Some(&9.29e-03));
        assert_eq!(sent[0].values.get("Backing"), Some(&6.1e-01));

        assert_eq!(mon.poll().unwrap(), Progress::Idle);
    }

    #[test]
    fn records_older_than_the_server_are_dropped_unsent() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        fs::write(
            folder.join("maxigauge 25-08-22.log"),
            "22-08-25,14:00:00,CH1,VACCAN ,1, 9.29e-03,0,1\n\
             22-08-25,15:30:00,CH1,VACCAN ,1, 8.80e-03,0,1\n",
        )
        .unwrap();

        // The server already holds data through 15:00, so the 14:00 line
        // was uploaded before the restart.
        let mut mon = monitor(dir.path(), at(15, 0, 0));

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        assert!(mon.client.mock_sent().is_empty());

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].time, at(15, 30, 0));
        assert_eq!(mon.client.latest(), at(15, 30, 0));
    }
}
