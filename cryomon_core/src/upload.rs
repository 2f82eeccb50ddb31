//! HTTP client for the monitoring store.
//!
//! Each uploader owns one client pointed at
//! `{base_url}/{fridge}` or `{base_url}/{fridge}/supp/{supp}`. At startup the
//! client asks the store for the newest stored timestamp so a restarted
//! daemon skips data it already delivered. Mock mode logs payloads instead
//! of posting them but keeps the latest-timestamp bookkeeping, which is all
//! the polling logic cares about.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use cryomon_config::UploadCfg;
use reqwest::blocking::Client as HttpClient;

use crate::error::{Result, UploadError};
use crate::time::{WallClock, parse_server_time, to_server_time};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_SNIPPET: usize = 200;

/// One upload: a batch of named values sharing a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub time: NaiveDateTime,
    pub values: BTreeMap<String, f64>,
}

impl Batch {
    pub fn new(time: NaiveDateTime) -> Self {
        Self {
            time,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, sensor: impl Into<String>, value: f64) {
        self.values.insert(sensor.into(), value);
    }
}

pub struct UploadClient {
    http: HttpClient,
    url: reqwest::Url,
    fridge: String,
    supp: Option<String>,
    mock: bool,
    mock_sent: Vec<Batch>,
    latest: NaiveDateTime,
    wall: Arc<dyn WallClock>,
}

impl UploadClient {
    /// Build a client for one upload target. Does no network I/O; call
    /// [`seed_latest`](Self::seed_latest) before first use.
    pub fn new(
        upload: &UploadCfg,
        supp: Option<String>,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let mut url = reqwest::Url::parse(&upload.base_url)
            .map_err(|e| eyre::eyre!("invalid base_url {}: {e}", upload.base_url))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| eyre::eyre!("base_url {} cannot carry a path", upload.base_url))?;
            segments.pop_if_empty().push(&upload.fridge);
            if let Some(supp) = supp.as_deref() {
                segments.push("supp").push(supp);
            }
        }
        let http = HttpClient::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| eyre::eyre!("building http client: {e}"))?;
        Ok(Self {
            http,
            url,
            fridge: upload.fridge.clone(),
            supp,
            mock: upload.mock,
            mock_sent: Vec::new(),
            latest: NaiveDateTime::default(),
            wall,
        })
    }

    /// Batches swallowed by mock mode, oldest first.
    pub fn mock_sent(&self) -> &[Batch] {
        &self.mock_sent
    }

    pub fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    /// Timestamp of the newest dataset the store has from us.
    pub fn latest(&self) -> NaiveDateTime {
        self.latest
    }

    /// Ask the store for its newest timestamp and remember it.
    ///
    /// A plain-text "No data returned" body means a freshly registered
    /// fridge; everything ever logged counts as new.
    pub fn seed_latest(&mut self) -> Result<()> {
        self.latest = self.fetch_latest()?;
        Ok(())
    }

    fn fetch_latest(&self) -> Result<NaiveDateTime> {
        if self.mock {
            return Ok(self.wall.now());
        }
        let res = self
            .http
            .get(self.url.clone())
            .query(&[("current", "")])
            .send()
            .map_err(transport)?;
        let status = res.status();
        let body = res.text().map_err(transport)?;
        if !status.is_success() {
            return Err(UploadError::Status {
                status: status.as_u16(),
                body: snippet(&body),
            }
            .into());
        }
        if body.trim() == "No data returned" {
            tracing::info!(fridge = %self.fridge, supp = ?self.supp, "store has no prior data");
            return Ok(NaiveDateTime::default());
        }
        let json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| UploadError::BadResponse(format!("latest query: {e}")))?;
        let time_str = json
            .get("time")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UploadError::BadResponse("latest query reply has no time field".into()))?;
        let latest = parse_server_time(time_str).ok_or_else(|| {
            UploadError::BadResponse(format!("cannot parse latest time {time_str:?}"))
        })?;
        tracing::info!(fridge = %self.fridge, supp = ?self.supp, %latest, "latest stored data");
        Ok(latest)
    }

    /// Post one batch as an HTML form, the shape the store ingests.
    pub fn upload(&mut self, batch: &Batch) -> Result<()> {
        let time_str = to_server_time(batch.time);
        if self.mock {
            tracing::info!(
                fridge = %self.fridge,
                supp = ?self.supp,
                time = %time_str,
                values = ?batch.values,
                "mock upload"
            );
            self.mock_sent.push(batch.clone());
            self.latest = self.latest.max(batch.time);
            return Ok(());
        }

        let mut form: Vec<(&str, String)> = Vec::with_capacity(batch.values.len() + 1);
        form.push(("time", time_str.clone()));
        for (sensor, value) in &batch.values {
            form.push((sensor.as_str(), value.to_string()));
        }
        let res = self
            .http
            .post(self.url.clone())
            .form(&form)
            .send()
            .map_err(transport)?;
        let status = res.status();
        let body = res.text().unwrap_or_default();
        if !status.is_success() {
            tracing::error!(
                fridge = %self.fridge,
                supp = ?self.supp,
                status = status.as_u16(),
                body = %snippet(&body),
                "upload rejected"
            );
            return Err(UploadError::Status {
                status: status.as_u16(),
                body: snippet(&body),
            }
            .into());
        }
        tracing::info!(
            fridge = %self.fridge,
            supp = ?self.supp,
            time = %time_str,
            status = status.as_u16(),
            "uploaded batch"
        );
        tracing::debug!(response = %snippet(&body));
        self.latest = self.latest.max(batch.time);
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> eyre::Report {
    UploadError::Transport(e.to_string()).into()
}

fn snippet(body: &str) -> String {
    let mut s: String = body.chars().take(BODY_SNIPPET).collect();
    if s.len() < body.len() {
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ManualWallClock;
    use chrono::NaiveDate;

    fn cfg(mock: bool) -> UploadCfg {
        UploadCfg {
            enabled: true,
            mock,
            base_url: "https://qsyd.sydney.edu.au/data".into(),
            fridge: "BlueFors LD".into(),
            ..UploadCfg::default()
        }
    }

    fn wall(t: NaiveDateTime) -> Arc<dyn WallClock> {
        Arc::new(ManualWallClock::new(t))
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 22)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn url_encodes_fridge_and_supp() {
        let c = UploadClient::new(&cfg(true), None, wall(noon())).unwrap();
        assert_eq!(c.endpoint(), "https://qsyd.sydney.edu.au/data/BlueFors%20LD");

        let c = UploadClient::new(&cfg(true), Some("Compressor_2".into()), wall(noon())).unwrap();
        assert_eq!(
            c.endpoint(),
            "https://qsyd.sydney.edu.au/data/BlueFors%20LD/supp/Compressor_2"
        );
    }

    #[test]
    fn trailing_slash_in_base_url_is_harmless() {
        let mut cfg = cfg(true);
        cfg.base_url = "https://example.org/data/".into();
        let c = UploadClient::new(&cfg, None, wall(noon())).unwrap();
        assert_eq!(c.endpoint(), "https://example.org/data/BlueFors%20LD");
    }

    #[test]
    fn mock_seed_uses_wall_clock() {
        let mut c = UploadClient::new(&cfg(true), None, wall(noon())).unwrap();
        c.seed_latest().unwrap();
        assert_eq!(c.latest(), noon());
    }

    #[test]
    fn mock_upload_advances_latest_monotonically() {
        let mut c = UploadClient::new(&cfg(true), None, wall(noon())).unwrap();
        let later = noon() + chrono::Duration::minutes(5);
        c.upload(&Batch::new(later)).unwrap();
        assert_eq!(c.latest(), later);

        // An older batch must not move latest backwards.
        c.upload(&Batch::new(noon())).unwrap();
        assert_eq!(c.latest(), later);
    }

    #[test]
    fn rejects_unusable_base_url() {
        let mut bad = cfg(true);
        bad.base_url = "not a url".into();
        assert!(UploadClient::new(&bad, None, wall(noon())).is_err());
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        let s = snippet(&long);
        assert!(s.len() < 250);
        assert!(s.ends_with("..."));
        assert_eq!(snippet("short"), "short");
    }
}
