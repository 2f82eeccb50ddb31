//! Per-channel temperature file monitor.
//!
//! Each configured sensor has its own `CH{n} T {date}.log` file, written a
//! few seconds apart around each measurement sweep. Readings are merged in
//! time order, held until every channel of the sweep has reported, and
//! flushed as one batch stamped with the sweep's oldest read time. A sensor
//! that stops logging (disabled channel, broken thermometer) must not hold
//! the batch hostage, so anything unuploaded gets flushed once it goes stale
//! against the wall clock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;

use cryomon_config::{BlueForsCfg, UploadCfg};
use cryomon_traits::Clock;

use super::{advance_day_folder, day_name, latest_folder};
use crate::error::Result;
use crate::logtail::ScalarCursor;
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

/// The newest parsed state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub value: Option<f64>,
    pub last_read: NaiveDateTime,
    pub uploaded: bool,
}

impl SensorReading {
    /// State before the first line: nothing held, nothing owed.
    fn unread() -> Self {
        Self {
            value: None,
            last_read: NaiveDateTime::default(),
            uploaded: true,
        }
    }

    fn is_stale(&self, max_age: chrono::Duration, reference: NaiveDateTime) -> bool {
        reference - self.last_read > max_age
    }
}

fn sensor_file(channel: u8, folder: &str) -> String {
    format!("CH{channel} T {folder}.log")
}

pub struct TempMonitor {
    client: UploadClient,
    clock: Arc<dyn Clock + Send + Sync>,
    wall: Arc<dyn WallClock>,
    log_dir: PathBuf,
    warn_interval: Duration,
    max_age: chrono::Duration,
    cwd: PathBuf,
    /// Sensor name → CH number.
    channels: BTreeMap<String, u8>,
    values: BTreeMap<String, SensorReading>,
    files: BTreeMap<String, ScalarCursor>,
}

impl TempMonitor {
    pub fn new(
        cfg: &BlueForsCfg,
        upload: &UploadCfg,
        clock: Arc<dyn Clock + Send + Sync>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let mut client = UploadClient::new(upload, None, wall.clone())?;
        client.seed_latest()?;

        let log_dir = PathBuf::from(&cfg.log_dir);
        let cwd = latest_folder(&log_dir, wall.today())?;
        tracing::info!(folder = %cwd.display(), "following BlueFors day folder");

        let mut monitor = Self {
            client,
            clock,
            wall,
            log_dir,
            warn_interval: Duration::from_secs_f64(cfg.log_warning_interval_s),
            max_age: chrono::Duration::milliseconds((cfg.max_age_s * 1000.0) as i64),
            cwd,
            channels: cfg.sensors.clone(),
            values: cfg
                .sensors
                .keys()
                .map(|sensor| (sensor.clone(), SensorReading::unread()))
                .collect(),
            files: BTreeMap::new(),
        };
        monitor.open_cursors();
        Ok(monitor)
    }

    fn open_cursors(&mut self) {
        let folder = day_name(&self.cwd);
        self.files = self
            .channels
            .iter()
            .map(|(sensor, channel)| {
                let path = self.cwd.join(sensor_file(*channel, &folder));
                (
                    sensor.clone(),
                    ScalarCursor::new(path, self.clock.clone(), self.warn_interval),
                )
            })
            .collect();
    }

    /// Earliest unread line across all sensor files, merge-sorted by
    /// (time, value, sensor name).
    fn peek_earliest(&mut self) -> Result<Option<(NaiveDateTime, f64, String)>> {
        let mut earliest: Option<(NaiveDateTime, f64, String)> = None;
        for (sensor, file) in &mut self.files {
            let peeked = file
                .peek()
                .map_err(|e| eyre::eyre!("reading {}: {e}", file.path().display()))?;
            let Some((time, value)) = peeked else {
                continue;
            };
            let candidate = (time, value, sensor.clone());
            if earliest.as_ref().is_none_or(|best| before(&candidate, best)) {
                earliest = Some(candidate);
            }
        }
        Ok(earliest)
    }

    /// Post everything held but not yet uploaded. Readings are marked
    /// uploaded only after the post succeeds, so a failed upload is retried
    /// with the data still in hand.
    fn flush(&mut self) -> Result<()> {
        let Some(batch) = self.build_batch() else {
            return Ok(());
        };
        self.client.upload(&batch)?;
        for reading in self.values.values_mut() {
            reading.uploaded = true;
        }
        Ok(())
    }

    /// Batch time is the *oldest* unuploaded read time: the server stores one
    /// row per batch, and the sweep started there. Uploaded-but-fresh values
    /// ride along so the row stays complete; values stale relative to the
    /// sweep are left out rather than resurrected.
    fn build_batch(&self) -> Option<Batch> {
        let unuploaded: Vec<&SensorReading> =
            self.values.values().filter(|r| !r.uploaded).collect();
        let newest = unuploaded.iter().map(|r| r.last_read).max()?;
        let oldest = unuploaded.iter().map(|r| r.last_read).min()?;

        let mut batch = Batch::new(oldest);
        for (sensor, reading) in &self.values {
            let Some(value) = reading.value else {
                continue;
            };
            if !reading.uploaded || !reading.is_stale(self.max_age, newest) {
                batch.insert(sensor.clone(), value);
            }
        }
        Some(batch)
    }
}

fn before(a: &(NaiveDateTime, f64, String), b: &(NaiveDateTime, f64, String)) -> bool {
    a.0.cmp(&b.0)
        .then_with(|| a.1.total_cmp(&b.1))
        .then_with(|| a.2.cmp(&b.2))
        .is_lt()
}

impl Poller for TempMonitor {
    fn name(&self) -> &str {
        "bluefors-temperature"
    }

    fn poll(&mut self) -> Result<Progress> {
        if let Some((time, value, sensor)) = self.peek_earliest()? {
            if let Some(file) = self.files.get_mut(&sensor) {
                file.pop()
                    .map_err(|e| eyre::eyre!("reading {}: {e}", file.path().display()))?;
            }
            tracing::debug!(sensor, %time, value, "read sensor value");

            let (held_value, held_uploaded) = match self.values.get(&sensor) {
                Some(reading) => (reading.value, reading.uploaded),
                None => (None, true),
            };

            // Same value logged again: the file advanced but the state did not.
            if held_value == Some(value) {
                return Ok(Progress::Advanced);
            }

            // About to overwrite a reading the server has not seen: flush first.
            if !held_uploaded {
                self.flush()?;
            }

            // A reading older than the server's newest was delivered before a
            // restart; hold it for batches but never post it again.
            let uploaded = time < self.client.latest();
            self.values.insert(
                sensor,
                SensorReading {
                    value: Some(value),
                    last_read: time,
                    uploaded,
                },
            );
            return Ok(Progress::Advanced);
        }

        // Nothing new anywhere. Flush anything going stale against the wall
        // clock; a dead channel must not hold the last sweep hostage.
        let now = self.wall.now();
        if self
            .values
            .values()
            .any(|r| !r.uploaded && r.is_stale(self.max_age, now))
        {
            tracing::warn!("uploading due to staleness; is new data flowing?");
            self.flush()?;
            return Ok(Progress::Advanced);
        }

        match advance_day_folder(&self.log_dir, &self.cwd, self.wall.as_ref())? {
            Some(folder) => {
                self.cwd = folder;
                self.open_cursors();
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
    use chrono::NaiveDate;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, d)
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

    fn cfg(dir: &TempDir, sensors: &[(&str, u8)]) -> BlueForsCfg {
        BlueForsCfg {
            enabled: true,
            log_dir: dir.path().to_str().unwrap().to_string(),
            interval_s: 1.0,
            log_warning_interval_s: 1800.0,
            max_age_s: 180.0,
            sensors: sensors
                .iter()
                .map(|(name, ch)| ((*name).to_string(), *ch))
                .collect(),
            upload_compressors: false,
            num_compressors: None,
            compressor_bounce_n: 15,
            upload_maxigauge: false,
        }
    }

    fn upload_cfg() -> UploadCfg {
        UploadCfg {
            mock: true,
            fridge: "BlueFors_LD".into(),
            ..UploadCfg::default()
        }
    }

    fn monitor(
        dir: &TempDir,
        sensors: &[(&str, u8)],
        wall: &Arc<ManualWallClock>,
    ) -> TempMonitor {
        let wall_dyn: Arc<dyn WallClock> = wall.clone();
        TempMonitor::new(
            &cfg(dir, sensors),
            &upload_cfg(),
            Arc::new(FakeClock::new()),
            wall_dyn,
        )
        .unwrap()
    }

    /// The slow-sweep scenario: five channels report at 22:00:01..04, the
    /// mixing chamber finally at 22:00:05. The staleness flush must carry
    /// all six values in one batch stamped 22:00:01.
    #[test]
    fn sweep_flushes_as_one_batch_stamped_with_its_oldest_reading() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let lines = [
            (1u8, "22:00:01", "45.2"),
            (2, "22:00:01", "3.12"),
            (3, "22:00:02", "4.01"),
            (4, "22:00:03", "3.33"),
            (5, "22:00:04", "0.850"),
            (6, "22:00:05", "0.015"),
        ];
        for (ch, time, value) in lines {
            append(
                &folder.join(format!("CH{ch} T 25-08-22.log")),
                &format!("22-08-25,{time},{value}\n"),
            );
        }

        let wall = Arc::new(ManualWallClock::new(at(22, 21, 59, 0)));
        let sensors = [
            ("Fifty_K", 1u8),
            ("Four_K", 2),
            ("Magnet", 3),
            ("MC_Pt", 4),
            ("Still", 5),
            ("MC", 6),
        ];
        let mut mon = monitor(&dir, &sensors, &wall);

        for _ in 0..6 {
            assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        }
        // Everything held, nothing posted yet.
        assert!(mon.client.mock_sent().is_empty());

        // Files dry up; the held sweep ages past max_age.
        wall.set(at(22, 22, 3, 10));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);

        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].time, at(22, 22, 0, 1));
        assert_eq!(sent[0].values.len(), 6);
        assert_eq!(sent[0].values.get("MC"), Some(&0.015));
        assert_eq!(mon.client.latest(), at(22, 22, 0, 1));

        assert_eq!(mon.poll().unwrap(), Progress::Idle);
    }

    #[test]
    fn repeated_values_advance_the_file_without_touching_state() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        let file = folder.join("CH6 T 25-08-22.log");
        append(&file, "22-08-25,10:00:00,0.015\n");
        append(&file, "22-08-25,10:01:00,0.015\n");
        append(&file, "22-08-25,10:02:00,0.016\n");

        let wall = Arc::new(ManualWallClock::new(at(22, 9, 0, 0)));
        let mut mon = monitor(&dir, &[("MC", 6)], &wall);

        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // stores 0.015
        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // duplicate, no state change
        assert!(mon.client.mock_sent().is_empty());

        // A different value lands while 0.015 is still owed: flush first.
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].time, at(22, 10, 0, 0));
        assert_eq!(sent[0].values.get("MC"), Some(&0.015));

        // The overwriting value is still held for the next flush.
        wall.set(at(22, 10, 10, 0));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        assert_eq!(mon.client.mock_sent().last().unwrap().values.get("MC"), Some(&0.016));
    }

    #[test]
    fn readings_older_than_the_server_are_held_but_not_reposted() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("25-08-22");
        fs::create_dir(&folder).unwrap();
        append(&folder.join("CH1 T 25-08-22.log"), "22-08-25,22:00:01,45.2\n");
        append(&folder.join("CH6 T 25-08-22.log"), "22-08-25,22:00:04,0.015\n");

        // The server already has data through 22:00:03 from before a restart.
        let wall = Arc::new(ManualWallClock::new(at(22, 22, 0, 3)));
        let mut mon = monitor(&dir, &[("Fifty_K", 1), ("MC", 6)], &wall);

        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // 22:00:01, pre-restart
        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // 22:00:04, new
        assert!(mon.client.mock_sent().is_empty());

        wall.set(at(22, 22, 3, 30));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced);
        let sent = mon.client.mock_sent();
        assert_eq!(sent.len(), 1);
        // Batch carries only the unuploaded reading's time, but the fresh
        // pre-restart value rides along to keep the row complete.
        assert_eq!(sent[0].time, at(22, 22, 0, 4));
        assert_eq!(sent[0].values.get("Fifty_K"), Some(&45.2));
        assert_eq!(sent[0].values.get("MC"), Some(&0.015));
    }

    #[test]
    fn day_rollover_rebuilds_cursors_in_the_new_folder() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("25-08-21");
        fs::create_dir(&old).unwrap();
        append(&old.join("CH6 T 25-08-21.log"), "21-08-25,23:59:50,0.015\n");

        // It is already the 22nd, but the new folder has not been created yet.
        let wall = Arc::new(ManualWallClock::new(at(22, 0, 0, 30)));
        let mut mon = monitor(&dir, &[("MC", 6)], &wall);

        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // old line, pre-latest
        assert_eq!(mon.poll().unwrap(), Progress::Idle); // rollover: nothing newer yet

        let new = dir.path().join("25-08-22");
        fs::create_dir(&new).unwrap();
        append(&new.join("CH6 T 25-08-22.log"), "22-08-25,00:01:00,0.014\n");

        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // folder advanced
        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // first line of the new day
        wall.set(at(22, 0, 5, 0));
        assert_eq!(mon.poll().unwrap(), Progress::Advanced); // stale flush
        assert_eq!(
            mon.client.mock_sent().last().unwrap().values.get("MC"),
            Some(&0.014)
        );
    }
}
