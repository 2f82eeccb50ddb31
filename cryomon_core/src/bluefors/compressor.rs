//! Compressor status-file monitor.
//!
//! All compressors of a fridge share one `Status_{date}.log`; with several
//! compressors the vendor suffixes each one's keys with `_{n}`. Uploads go
//! to the `Compressor` supplementary stream (`Compressor_{n}` each, when
//! numbered), translated from vendor keys to the site's field names, plus a
//! bounce estimate computed from the recent pressure history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cryomon_config::{BlueForsCfg, UploadCfg};
use cryomon_traits::Clock;

use super::{advance_day_folder, day_name, latest_folder};
use crate::bounce::BounceWindow;
use crate::error::Result;
use crate::logtail::MapCursor;
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

/// Upload field name → vendor log key.
const CPA_FIELDS: [(&str, &str); 8] = [
    ("Low", "cpalpa"),
    ("High", "cpahpa"),
    ("Delta", "cpadp"),
    ("WaterIn", "cpatempwi"),
    ("WaterOut", "cpatempwo"),
    ("Oil", "cpatempo"),
    ("Helium", "cpatemph"),
    ("Current", "cpacurrent"),
];
/// Instantaneous pressures feeding the bounce estimate.
const CPA_BOUNCE_LOW: &str = "cpalp";
const CPA_BOUNCE_HIGH: &str = "cpahp";

fn status_file(folder: &str) -> String {
    format!("Status_{folder}.log")
}

pub struct CompressorMonitor {
    client: UploadClient,
    clock: Arc<dyn Clock + Send + Sync>,
    wall: Arc<dyn WallClock>,
    log_dir: PathBuf,
    warn_interval: Duration,
    cwd: PathBuf,
    status: MapCursor,
    /// Upload name → suffixed vendor key.
    field_map: Vec<(String, String)>,
    low_key: String,
    high_key: String,
    low: BounceWindow,
    high: BounceWindow,
    supp: String,
}

impl CompressorMonitor {
    pub fn new(
        cfg: &BlueForsCfg,
        upload: &UploadCfg,
        compressor_num: Option<u32>,
        clock: Arc<dyn Clock + Send + Sync>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let supp = match compressor_num {
            None => "Compressor".to_string(),
            Some(n) => format!("Compressor_{n}"),
        };
        let mut client = UploadClient::new(upload, Some(supp.clone()), wall.clone())?;
        client.seed_latest()?;

        // Only second-and-later compressors get suffixed keys in the file.
        let suffix = match compressor_num {
            Some(n) if n > 1 => format!("_{n}"),
            _ => String::new(),
        };
        let field_map = CPA_FIELDS
            .iter()
            .map(|(upload_name, log_key)| ((*upload_name).to_string(), format!("{log_key}{suffix}")))
            .collect();

        let log_dir = PathBuf::from(&cfg.log_dir);
        let cwd = latest_folder(&log_dir, wall.today())?;
        let warn_interval = Duration::from_secs_f64(cfg.log_warning_interval_s);
        let status = MapCursor::new(
            cwd.join(status_file(&day_name(&cwd))),
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
            field_map,
            low_key: format!("{CPA_BOUNCE_LOW}{suffix}"),
            high_key: format!("{CPA_BOUNCE_HIGH}{suffix}"),
            low: BounceWindow::new(cfg.compressor_bounce_n),
            high: BounceWindow::new(cfg.compressor_bounce_n),
            supp,
        })
    }

    fn reopen(&mut self) {
        self.status = MapCursor::new(
            self.cwd.join(status_file(&day_name(&self.cwd))),
            self.clock.clone(),
            self.warn_interval,
        );
    }

    /// Push one pressure pair; the estimate is defined once the windows fill.
    fn push_bounce(&mut self, low: f64, high: f64) -> Option<f64> {
        self.low.push(low);
        self.high.push(high);
        match (self.low.amplitude(), self.high.amplitude()) {
            (Some(l), Some(h)) => Some((l + h) / 2.0),
            _ => None,
        }
    }
}

impl Poller for CompressorMonitor {
    fn name(&self) -> &str {
        "bluefors-compressor"
    }

    fn poll(&mut self) -> Result<Progress> {
        let next = self
            .status
            .pop()
            .map_err(|e| eyre::eyre!("reading {}: {e}", self.status.path().display()))?;
        if let Some((time, fields)) = next {
            // Already delivered before a restart. Skip without touching the
            // pressure history: its sampling cadence must match what gets
            // uploaded alongside it.
            if time < self.client.latest() {
                return Ok(Progress::Advanced);
            }

            let mut batch = Batch::new(time);
            let mut missing: Vec<&str> = Vec::new();
            for (upload_name, log_key) in &self.field_map {
                match fields.get(log_key) {
                    Some(value) => batch.insert(upload_name.clone(), *value),
                    None => missing.push(upload_name.as_str()),
                }
            }
            if !missing.is_empty() {
                tracing::warn!(
                    compressor = %self.supp,
                    ?missing,
                    "status line is missing fields"
                );
            }

            match (fields.get(&self.low_key), fields.get(&self.high_key)) {
                (Some(&low), Some(&high)) => {
                    if let Some(bounce) = self.push_bounce(low, high) {
                        batch.insert("Bounce", bounce);
                    }
                }
                _ => {
                    tracing::warn!(
                        compressor = %self.supp,
                        "cannot estimate bounce; pressure fields missing"
                    );
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
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn append(path: &Path, text: &str) {
        use std::io::Write;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn cfg(dir: &TempDir, bounce_n: usize) -> BlueForsCfg {
        BlueForsCfg {
            enabled: true,
            log_dir: dir.path().to_str().unwrap().to_string(),
            interval_s: 1.0,
            log_warning_interval_s: 1800.0,
            max_age_s: 180.0,
            sensors: [("MC".to_string(), 6u8)].into(),
            upload_compressors: true,
            num_compressors: None,
            compressor_bounce_n: bounce_n,
            upload_maxigauge: false,
        }
    }

    fn monitor(
        dir: &TempDir,
        bounce_n: usize,
        num: Option<u32>,
        wall: &Arc<ManualWallClock>,
    ) -> CompressorMonitor {
        let wall_dyn: Arc<dyn WallClock> = wall.clone();
        let upload = UploadCfg {
            mock: true,
            fridge: "BlueFors_LD".into(),
            ..UploadCfg::default()
        };
        CompressorMonitor::new(
            &cfg(dir, bounce_n),
            &upload,
            num,
            Arc::new(FakeClock::new()),
            wall_dyn,
        )
        .unwrap()
    }

    fn status_line(time: &str, suffix: &str, lp: f64, hp: f64) -> String {
        format!(
            "22-08-25,{time},cpalpa{s},98.4,cpahpa{s},297.1,cpadp{s},198.7,\
             cpatempwi{s},21.5,cpatempwo{s},28.9,cpatempo{s},39.2,cpatemph{s},75.3,\
             cpacurrent{s},17.8,cpalp{s},{lp},cpahp{s},{hp}\n",
            s = suffix,
            time = time,
            lp = lp,
            hp = hp,
        )
    }

    #[test]
    fn translates_vendor_keys_and_uploads_zero_bounce() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let file = folder.join("Status_25-08-22.log");
        // Identical pressures: the bounce estimate is a legitimate 0.0.
        append(&file, &status_line("12:00:00", "", 98.0, 297.0));
        append(&file, &status_line("12:00:30", "", 98.0, 297.0));

        let wall = Arc::new(ManualWallClock::new(at(11, 0, 0)));
        let mut mon = monitor(&dir, 2, None, &wall);

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 2);

        assert_eq!(sent[0].values.get("Low"), Some(&98.4));
        assert_eq!(sent[0].values.get("High"), Some(&297.1));
        assert_eq!(sent[0].values.get("WaterIn"), Some(&21.5));
        assert_eq!(sent[0].values.get("Current"), Some(&17.8));
        // One sample in a two-sample window: not defined yet.
        assert!(!sent[0].values.contains_key("Bounce"));
        // Window full; flat pressures must still upload their 0.0 estimate.
        assert_eq!(sent[1].values.get("Bounce"), Some(&0.0));
    }

    #[test]
    fn second_compressor_reads_suffixed_keys() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let file = folder.join("Status_25-08-22.log");
        append(&file, &status_line("12:00:00", "_2", 98.0, 297.0));

        let wall = Arc::new(ManualWallClock::new(at(11, 0, 0)));
        let mut mon = monitor(&dir, 15, Some(2), &wall);
        assert_eq!(mon.supp, "Compressor_2");

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        // Upload names stay unsuffixed; only the vendor keys carry `_2`.
        assert_eq!(sent[0].values.get("Low"), Some(&98.4));
        assert_eq!(sent[0].values.get("Oil"), Some(&39.2));

        // A first compressor would find nothing in this file.
        let mut first = monitor(&dir, 15, Some(1), &wall);
        assert_eq!(first.supp, "Compressor_1");
        assert_eq!(first.poll().unwrap(), Progress::Advanced);
        let sent = first.client.mock_sent();
        assert!(sent[0].values.is_empty());
    }

    #[test]
    fn pre_restart_records_do_not_feed_the_pressure_history() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let file = folder.join("Status_25-08-22.log");
        append(&file, &status_line("11:59:00", "", 97.0, 296.0)); // pre-restart
        append(&file, &status_line("12:00:30", "", 98.0, 297.0));
        append(&file, &status_line("12:01:00", "", 98.0, 297.0));

        let wall = Arc::new(ManualWallClock::new(at(12, 0, 0)));
        let mut mon = monitor(&dir, 2, None, &wall);

        // Dropped record: consumed, not uploaded, not in the windows.
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        assert!(mon.client.mock_sent().is_empty());

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 2);
        // Had the dropped record been pushed, the window would have filled a
        // record early.
        assert!(!sent[0].values.contains_key("Bounce"));
        assert!(sent[1].values.contains_key("Bounce"));
    }

    #[test]
    fn missing_pressure_keys_warn_but_do_not_block_the_upload() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let file = folder.join("Status_25-08-22.log");
        append(&file, "22-08-25,12:00:00,cpalpa,98.4,cpahpa,297.1\n");

        let wall = Arc::new(ManualWallClock::new(at(11, 0, 0)));
        let mut mon = monitor(&dir, 2, None, &wall);

        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].values.get("Low"), Some(&98.4));
        assert!(!sent[0].values.contains_key("Bounce"));
        assert!(mon.low.is_empty());
    }
}
