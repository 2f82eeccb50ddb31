//! Calendar time plumbing.
//!
//! Vendor logs carry naive local timestamps, so monitors work in naive local
//! time throughout and the UTC offset is only attached at upload. The
//! [`WallClock`] seam keeps date rollover and staleness logic testable
//! without waiting for midnight.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};

pub trait WallClock: Send + Sync {
    /// Local wall-clock time, naive to match the vendor logs.
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Attach the local UTC offset and render RFC 3339 for the server.
///
/// A timestamp inside a DST spring-forward gap has no local offset; it is
/// sent without one, which the server's parser accepts.
pub fn to_server_time(t: NaiveDateTime) -> String {
    t.and_local_timezone(Local)
        .earliest()
        .map_or_else(|| t.format("%Y-%m-%dT%H:%M:%S").to_string(), |dt| dt.to_rfc3339())
}

/// Parse a timestamp string the server is known to emit.
///
/// The server answers with RFC 3339, but older deployments reply in ctime
/// form ("Mon Aug 25 07:03:01 2025") and some strip the offset entirely.
pub fn parse_server_time(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    for fmt in [
        "%a %b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    None
}
