//! Incremental vendor-log reading.
//!
//! Log files are tailed, never rewound: each cursor remembers how far it got
//! and hands out one parsed record per call. Files that do not exist yet are
//! tolerated (BlueFors creates the day's file on first write), with the
//! missing-file warning throttled so an unused channel does not flood the
//! log. Only complete lines are consumed; a line the vendor software is
//! still writing stays buffered until its newline arrives.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use cryomon_traits::Clock;

/// Timestamp layout at the head of every BlueFors log line.
pub const BLUEFORS_STAMP: &str = "%d-%m-%y %H:%M:%S";

/// Parse the two leading CSV fields of a BlueFors line into a timestamp.
pub fn parse_stamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let joined = format!("{} {}", date.trim(), time.trim());
    NaiveDateTime::parse_from_str(&joined, BLUEFORS_STAMP).ok()
}

/// Follows one growing file, yielding complete lines as they appear.
pub struct TailReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    partial: String,
    clock: Arc<dyn Clock + Send + Sync>,
    warn_interval: Duration,
    last_missing_warn: Option<Instant>,
}

impl TailReader {
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
        warn_interval: Duration,
    ) -> Self {
        let path = path.into();
        tracing::debug!(file = %path.display(), "tailing sensor file");
        Self {
            path,
            reader: None,
            partial: String::new(),
            clock,
            warn_interval,
            last_missing_warn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next complete line, without its terminator, or `None` when caught
    /// up (or the file does not exist yet).
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(f) => self.reader = Some(BufReader::new(f)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.warn_missing();
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut chunk = String::new();
        let n = reader.read_line(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        self.partial.push_str(&chunk);
        if !self.partial.ends_with('\n') {
            // Mid-write; keep what we have and wait for the rest.
            return Ok(None);
        }
        let line = std::mem::take(&mut self.partial);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn warn_missing(&mut self) {
        let now = self.clock.now();
        let due = self
            .last_missing_warn
            .is_none_or(|t| now.saturating_duration_since(t) >= self.warn_interval);
        if due {
            tracing::warn!(
                file = %self.path.display(),
                "sensor file not found; may not exist yet, will keep trying"
            );
            self.last_missing_warn = Some(now);
        }
    }
}

/// Cursor over `dd-mm-yy,HH:MM:SS,<rest>` lines.
///
/// Lines whose timestamp does not parse are consumed, logged, and skipped;
/// a corrupt line must not wedge the whole monitor.
pub struct RawCursor {
    tail: TailReader,
    peeked: Option<(NaiveDateTime, String)>,
}

impl RawCursor {
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
        warn_interval: Duration,
    ) -> Self {
        Self {
            tail: TailReader::new(path, clock, warn_interval),
            peeked: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.tail.path()
    }

    pub fn peek(&mut self) -> io::Result<Option<&(NaiveDateTime, String)>> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.as_ref())
    }

    pub fn pop(&mut self) -> io::Result<Option<(NaiveDateTime, String)>> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.take())
    }

    fn read_next(&mut self) -> io::Result<Option<(NaiveDateTime, String)>> {
        while let Some(line) = self.tail.next_line()? {
            let mut fields = line.splitn(3, ',');
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(date), Some(time), Some(rest)) => {
                    parse_stamp(date, time).map(|t| (t, rest.to_string()))
                }
                _ => None,
            };
            match parsed {
                Some(entry) => return Ok(Some(entry)),
                None => {
                    tracing::warn!(
                        file = %self.tail.path().display(),
                        line,
                        "skipping unparseable log line"
                    );
                }
            }
        }
        Ok(None)
    }
}

/// Cursor over single-value lines (`CH6 T 25-08-22.log` and friends).
pub struct ScalarCursor {
    raw: RawCursor,
    peeked: Option<(NaiveDateTime, f64)>,
}

impl ScalarCursor {
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
        warn_interval: Duration,
    ) -> Self {
        Self {
            raw: RawCursor::new(path, clock, warn_interval),
            peeked: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.raw.path()
    }

    pub fn peek(&mut self) -> io::Result<Option<(NaiveDateTime, f64)>> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked)
    }

    pub fn pop(&mut self) -> io::Result<Option<(NaiveDateTime, f64)>> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.take())
    }

    fn read_next(&mut self) -> io::Result<Option<(NaiveDateTime, f64)>> {
        while let Some((time, rest)) = self.raw.pop()? {
            match rest.trim().parse::<f64>() {
                Ok(v) => return Ok(Some((time, v))),
                Err(_) => {
                    tracing::warn!(
                        file = %self.raw.path().display(),
                        value = rest,
                        "skipping log line with unparseable value"
                    );
                }
            }
        }
        Ok(None)
    }
}

/// Cursor over key,value-pair lines (`Status_{date}.log`).
///
/// The remainder of each line alternates field names and numbers; pairs
/// whose number does not parse are dropped individually.
pub struct MapCursor {
    raw: RawCursor,
}

impl MapCursor {
    pub fn new(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
        warn_interval: Duration,
    ) -> Self {
        Self {
            raw: RawCursor::new(path, clock, warn_interval),
        }
    }

    pub fn path(&self) -> &Path {
        self.raw.path()
    }

    pub fn pop(&mut self) -> io::Result<Option<(NaiveDateTime, BTreeMap<String, f64>)>> {
        let Some((time, rest)) = self.raw.pop()? else {
            return Ok(None);
        };
        let mut values = BTreeMap::new();
        let mut fields = rest.split(',');
        while let Some(key) = fields.next() {
            let Some(raw_value) = fields.next() else {
                tracing::warn!(
                    file = %self.raw.path().display(),
                    key,
                    "status line has a key with no value; dropping it"
                );
                break;
            };
            match raw_value.trim().parse::<f64>() {
                Ok(v) => {
                    values.insert(key.trim().to_string(), v);
                }
                Err(_) => {
                    tracing::warn!(
                        file = %self.raw.path().display(),
                        key,
                        value = raw_value,
                        "dropping status field with unparseable value"
                    );
                }
            }
        }
        Ok(Some((time, values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FakeClock;
    use chrono::{NaiveDate, Timelike};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn clock() -> Arc<dyn Clock + Send + Sync> {
        Arc::new(FakeClock::new())
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn stamp(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn missing_file_is_tolerated_until_it_appears() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CH6 T 25-08-22.log");
        let mut cursor = ScalarCursor::new(&path, clock(), Duration::from_secs(1800));

        assert_eq!(cursor.peek().unwrap(), None);
        assert_eq!(cursor.pop().unwrap(), None);

        append(&path, "22-08-25,22:00:01,0.0153\n");
        assert_eq!(cursor.pop().unwrap(), Some((stamp(22, 0, 1), 0.0153)));
    }

    #[test]
    fn partial_lines_wait_for_their_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CH1 T 25-08-22.log");
        append(&path, "22-08-25,10:00:00,1.5\n22-08-25,10:00:01,1.");
        let mut cursor = ScalarCursor::new(&path, clock(), Duration::from_secs(1800));

        assert_eq!(cursor.pop().unwrap(), Some((stamp(10, 0, 0), 1.5)));
        assert_eq!(cursor.pop().unwrap(), None);

        append(&path, "75\n");
        assert_eq!(cursor.pop().unwrap(), Some((stamp(10, 0, 1), 1.75)));
    }

    #[test]
    fn peek_is_idempotent_and_pop_advances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CH2 T 25-08-22.log");
        append(&path, "22-08-25,09:00:00,4.0\r\n22-08-25,09:00:05,4.1\n");
        let mut cursor = ScalarCursor::new(&path, clock(), Duration::from_secs(1800));

        let first = cursor.peek().unwrap();
        assert_eq!(first, cursor.peek().unwrap());
        assert_eq!(first, Some((stamp(9, 0, 0), 4.0)));

        assert_eq!(cursor.pop().unwrap(), first);
        assert_eq!(cursor.peek().unwrap(), Some((stamp(9, 0, 5), 4.1)));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CH5 T 25-08-22.log");
        append(
            &path,
            "22-08-25,08:00:00,2.0\n\
             not a log line\n\
             99-99-99,26:61:61,3.0\n\
             22-08-25,08:00:10,oops\n\
             22-08-25,08:00:20,2.2\n",
        );
        let mut cursor = ScalarCursor::new(&path, clock(), Duration::from_secs(1800));

        assert_eq!(cursor.pop().unwrap(), Some((stamp(8, 0, 0), 2.0)));
        assert_eq!(cursor.pop().unwrap(), Some((stamp(8, 0, 20), 2.2)));
        assert_eq!(cursor.pop().unwrap(), None);
    }

    #[test]
    fn map_cursor_pairs_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Status_25-08-22.log");
        append(
            &path,
            "22-08-25,12:30:00,cpalp,98.4,cpahp,297.1,cpastate,3\n\
             22-08-25,12:30:30,cpalp,98.6,cpahp,bad,dangling\n",
        );
        let mut cursor = MapCursor::new(&path, clock(), Duration::from_secs(1800));

        let (time, values) = cursor.pop().unwrap().unwrap();
        assert_eq!(time.hour(), 12);
        assert_eq!(values.get("cpalp"), Some(&98.4));
        assert_eq!(values.get("cpahp"), Some(&297.1));
        assert_eq!(values.get("cpastate"), Some(&3.0));

        // Second line: bad number dropped, dangling key dropped, rest kept.
        let (_, values) = cursor.pop().unwrap().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("cpalp"), Some(&98.6));

        assert!(cursor.pop().unwrap().is_none());
    }
}
