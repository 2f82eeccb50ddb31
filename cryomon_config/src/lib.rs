#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and calibration curves for the fridge monitor.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Each `[[uploader]]` table carries a `type` tag that selects the
//!   uploader variant; the tag set is closed, so a typo fails at parse time
//!   rather than silently configuring nothing.
//! - Calibration curves (built-in tables plus `[calibration.*]` overrides)
//!   live in [`curves`] so sensor→curve references validate at load.

pub mod curves;

use std::collections::BTreeMap;

use serde::Deserialize;

pub use curves::{CalibrationCurve, builtin_curves};

/// Upload destination and global scheduling knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadCfg {
    /// Master switch; `run` refuses to start when false.
    pub enabled: bool,
    /// Log payloads instead of posting them.
    pub mock: bool,
    pub base_url: String,
    /// Fridge name as registered on the server. "?" means unset.
    pub fridge: String,
    /// Rebuild a poller whose thread died instead of leaving it down.
    pub restart_on_failure: bool,
    /// Seconds to wait before rebuilding a failed poller.
    pub restart_wait_s: f64,
}

impl Default for UploadCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            mock: false,
            base_url: "https://qsyd.sydney.edu.au/data".into(),
            fridge: "?".into(),
            restart_on_failure: false,
            restart_wait_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingCfg {
    /// Directory for rotated log files (stderr only when unset).
    pub dir: Option<String>,
    pub level: Option<String>, // "info", "debug"
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// One configured uploader. The `type` tag is the registry: adding a variant
/// here (plus its builder in the core registry) is all it takes to make a
/// new uploader configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum UploaderCfg {
    #[serde(rename = "sample")]
    Sample(SampleCfg),
    #[serde(rename = "bluefors")]
    BlueFors(BlueForsCfg),
    #[serde(rename = "leiden")]
    Leiden(LeidenCfg),
    #[serde(rename = "avs47")]
    Avs47(Avs47Cfg),
    #[serde(rename = "lakeshore336")]
    Lakeshore336(LakeshoreCfg),
    #[serde(rename = "cryomech")]
    Cryomech(CryomechCfg),
    #[serde(rename = "maxigauge")]
    MaxiGauge(MaxiGaugeCfg),
}

impl UploaderCfg {
    /// Name used for thread naming and supervisor reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sample(_) => "sample",
            Self::BlueFors(_) => "bluefors",
            Self::Leiden(_) => "leiden",
            Self::Avs47(_) => "avs47",
            Self::Lakeshore336(_) => "lakeshore336",
            Self::Cryomech(_) => "cryomech",
            Self::MaxiGauge(_) => "maxigauge",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Sample(c) => c.enabled,
            Self::BlueFors(c) => c.enabled,
            Self::Leiden(c) => c.enabled,
            Self::Avs47(c) => c.enabled,
            Self::Lakeshore336(c) => c.enabled,
            Self::Cryomech(c) => c.enabled,
            Self::MaxiGauge(c) => c.enabled,
        }
    }

    /// Supplementary dataset this uploader posts to, if any. The log
    /// monitors post to the main dataset (plus their own internal supps).
    pub fn supp(&self) -> Option<&str> {
        match self {
            Self::BlueFors(_) | Self::Leiden(_) => None,
            Self::Sample(c) => c.supp.as_deref(),
            Self::Avs47(c) => c.supp.as_deref(),
            Self::Lakeshore336(c) => c.supp.as_deref(),
            Self::Cryomech(c) => c.supp.as_deref(),
            Self::MaxiGauge(c) => c.supp.as_deref(),
        }
    }
}

/// Demo uploader posting random-walk values; used to exercise a freshly
/// registered fridge end to end.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SampleCfg {
    pub enabled: bool,
    pub supp: Option<String>,
    pub interval_s: f64,
    pub fields: Vec<String>,
}

impl Default for SampleCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            supp: None,
            interval_s: 20.0,
            fields: vec!["Field_1".into(), "Field_2".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueForsCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root of the BlueFors log tree (contains one `yy-mm-dd` folder per day).
    pub log_dir: String,
    #[serde(default = "default_tail_interval")]
    pub interval_s: f64,
    /// Warn about a missing sensor file at most this often.
    #[serde(default = "default_log_warning_interval")]
    pub log_warning_interval_s: f64,
    /// Held readings older than this are flushed even if incomplete.
    #[serde(default = "default_max_age")]
    pub max_age_s: f64,
    /// Sensor name → CH number of its `CH{n} T {date}.log` file.
    #[serde(default = "default_bluefors_sensors")]
    pub sensors: BTreeMap<String, u8>,
    #[serde(default = "default_true")]
    pub upload_compressors: bool,
    pub num_compressors: Option<u32>,
    #[serde(default = "default_bounce_n")]
    pub compressor_bounce_n: usize,
    #[serde(default = "default_true")]
    pub upload_maxigauge: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeidenCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Flat directory of `LogAVS_*.dat` files.
    pub log_dir: String,
    #[serde(default = "default_tail_interval")]
    pub interval_s: f64,
    /// Regex with one capture group holding the file timestamp.
    #[serde(default = "default_leiden_pattern")]
    pub file_pattern: String,
    /// Look for a newer log file after this long with no new data.
    #[serde(default = "default_new_log_check")]
    pub new_log_check_interval_s: f64,
    /// Sensor name → tab-separated column index (column 0 is the timestamp).
    #[serde(default = "default_leiden_sensors")]
    pub sensors: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Avs47ChannelCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sensor: String,
    pub calibration: String,
    /// Seconds to wait after the final range change before reading.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_s: f64,
    #[serde(default = "default_average_count")]
    pub average_count: u32,
    #[serde(default = "default_average_delay")]
    pub average_delay_s: f64,
    /// Excitation voltage label; one of 0, 3uV, 10uV, 30uV, 100uV, 300uV, 1mV, 3mV.
    #[serde(default = "default_excitation")]
    pub excitation: String,
    /// Finish settling early once readings are stable.
    #[serde(default = "default_true")]
    pub quick_settle: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Avs47Cfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub supp: Option<String>,
    /// Serial device whose RTS/DTR/CTS lines drive the bridge.
    pub port: String,
    /// Bridge address for chained units.
    #[serde(default = "default_avs_address")]
    pub address: u8,
    /// Pause between scan sweeps.
    #[serde(default = "default_instr_interval")]
    pub interval_s: f64,
    #[serde(default)]
    pub upload_millikelvin: bool,
    #[serde(default = "default_bitbang_delay")]
    pub bitbang_delay_ms: f64,
    #[serde(default = "default_quick_settle_points")]
    pub quick_settle_points: usize,
    #[serde(default = "default_quick_settle_tolerance")]
    pub quick_settle_tolerance: f64,
    /// Bridge channel (0..=7) → channel settings.
    #[serde(default, deserialize_with = "u8_keyed")]
    pub channels: BTreeMap<u8, Avs47ChannelCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LakeshoreCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub supp: Option<String>,
    /// `tcp://host:port` or a serial device path.
    pub address: String,
    pub baud: Option<u32>,
    #[serde(default = "default_instr_interval")]
    pub interval_s: f64,
    #[serde(default)]
    pub upload_millikelvin: bool,
    /// Input letter (A..D) → sensor name.
    #[serde(default = "default_lakeshore_sensors")]
    pub sensors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryomechCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub supp: Option<String>,
    pub address: String,
    /// v1 is the generation with the 7x3 segment display.
    #[serde(default = "default_cryomech_version")]
    pub version: String,
    #[serde(default = "default_cryomech_address")]
    pub compressor_address: u8,
    #[serde(default = "default_cryomech_baud")]
    pub baud: Option<u32>,
    #[serde(default = "default_instr_interval")]
    pub interval_s: f64,
    /// Estimate bounce from pressure history instead of trusting the
    /// compressor's own register.
    #[serde(default)]
    pub use_calculated_bounce: bool,
    #[serde(default = "default_bounce_n")]
    pub compressor_bounce_n: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxiGaugeCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub supp: Option<String>,
    pub address: String,
    #[serde(default = "default_maxigauge_baud")]
    pub baud: Option<u32>,
    #[serde(default = "default_instr_interval")]
    pub interval_s: f64,
    /// Gauge channel (1..=6) → sensor name.
    #[serde(default = "default_maxigauge_sensors", deserialize_with = "u8_keyed")]
    pub sensors: BTreeMap<u8, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub upload: UploadCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
    #[serde(default, rename = "uploader")]
    pub uploaders: Vec<UploaderCfg>,
    /// Custom calibration curves; these shadow built-ins of the same name.
    #[serde(default)]
    pub calibration: BTreeMap<String, CalibrationCurve>,
}

/// TOML table keys are strings; channel maps want numbers.
fn u8_keyed<'de, D, V>(de: D) -> Result<BTreeMap<u8, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: serde::Deserialize<'de>,
{
    let raw = BTreeMap::<String, V>::deserialize(de)?;
    let mut out = BTreeMap::new();
    for (k, v) in raw {
        let n: u8 = k
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("channel key '{k}' is not a number")))?;
        out.insert(n, v);
    }
    Ok(out)
}

fn default_true() -> bool {
    true
}
fn default_tail_interval() -> f64 {
    1.0
}
fn default_settle_delay() -> f64 {
    10.0
}
fn default_average_count() -> u32 {
    3
}
fn default_average_delay() -> f64 {
    1.0
}
fn default_excitation() -> String {
    "30uV".into()
}
fn default_instr_interval() -> f64 {
    20.0
}
fn default_log_warning_interval() -> f64 {
    1800.0
}
fn default_max_age() -> f64 {
    180.0
}
fn default_bounce_n() -> usize {
    15
}
fn default_new_log_check() -> f64 {
    300.0
}
fn default_leiden_pattern() -> String {
    r"LogAVS_Reilly-DR__([0-9]{4}-[0-9]{2}-[0-9]{2}-[0-9]{2}-[0-9]{2}-[0-9]{2})\.dat".into()
}
fn default_avs_address() -> u8 {
    1
}
fn default_bitbang_delay() -> f64 {
    1.0
}
fn default_quick_settle_points() -> usize {
    4
}
fn default_quick_settle_tolerance() -> f64 {
    0.01
}
fn default_cryomech_version() -> String {
    "v1".into()
}
fn default_cryomech_address() -> u8 {
    16
}
fn default_cryomech_baud() -> Option<u32> {
    Some(115_200)
}
fn default_maxigauge_baud() -> Option<u32> {
    Some(9600)
}

fn default_bluefors_sensors() -> BTreeMap<String, u8> {
    [
        ("Fifty_K".to_string(), 1),
        ("Four_K".to_string(), 2),
        ("Magnet".to_string(), 3),
        ("Still".to_string(), 5),
        ("MC".to_string(), 6),
    ]
    .into()
}

fn default_leiden_sensors() -> BTreeMap<String, usize> {
    [
        ("Four_K_RuO".to_string(), 10),
        ("Still_RuO".to_string(), 11),
        ("Fifty_mK_RuO".to_string(), 12),
        ("MC_CMN".to_string(), 13),
        ("MC_PT".to_string(), 14),
    ]
    .into()
}

fn default_lakeshore_sensors() -> BTreeMap<String, String> {
    [
        ("A".to_string(), "Four_K_Pt".to_string()),
        ("B".to_string(), "Fifty_K_Pt".to_string()),
        ("C".to_string(), "Four_K_RuO".to_string()),
        ("D".to_string(), "Sample".to_string()),
    ]
    .into()
}

fn default_maxigauge_sensors() -> BTreeMap<u8, String> {
    [
        (3u8, "OVC".to_string()),
        (4u8, "IVC".to_string()),
        (5u8, "Still".to_string()),
    ]
    .into()
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_path(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {}: {}", path.display(), e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {}: {}", path.display(), e))?;
    Ok(cfg)
}

impl Config {
    /// All curves visible to this configuration (built-ins shadowed by
    /// `[calibration.*]` entries).
    pub fn curve(&self, name: &str) -> Option<CalibrationCurve> {
        if let Some(c) = self.calibration.get(name) {
            return Some(c.clone());
        }
        builtin_curves().get(name).cloned()
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // Upload target
        if self.upload.base_url.is_empty() {
            eyre::bail!("upload.base_url must be set");
        }
        if !self.upload.base_url.starts_with("http://") && !self.upload.base_url.starts_with("https://")
        {
            eyre::bail!("upload.base_url must be an http(s) URL");
        }
        if self.upload.fridge.is_empty() || self.upload.fridge == "?" {
            eyre::bail!("upload.fridge must be set to the fridge name registered on the server");
        }
        if self.upload.restart_wait_s <= 0.0 {
            eyre::bail!("upload.restart_wait_s must be > 0");
        }
        if self.uploaders.is_empty() {
            eyre::bail!("at least one [[uploader]] must be configured");
        }

        for (curve_name, curve) in &self.calibration {
            curve
                .check()
                .map_err(|e| eyre::eyre!("calibration.{}: {}", curve_name, e))?;
        }

        for (i, up) in self.uploaders.iter().enumerate() {
            self.validate_uploader(up)
                .map_err(|e| eyre::eyre!("uploader[{}] ({}): {}", i, up.kind(), e))?;
        }

        Ok(())
    }

    fn validate_uploader(&self, up: &UploaderCfg) -> eyre::Result<()> {
        match up {
            UploaderCfg::Sample(c) => {
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.fields.is_empty() {
                    eyre::bail!("fields must not be empty");
                }
            }
            UploaderCfg::BlueFors(c) => {
                if c.log_dir.is_empty() {
                    eyre::bail!("log_dir must be set");
                }
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.max_age_s <= 0.0 {
                    eyre::bail!("max_age_s must be > 0");
                }
                if c.sensors.is_empty() {
                    eyre::bail!("sensors must not be empty");
                }
                if c.upload_compressors {
                    if let Some(n) = c.num_compressors
                        && n == 0
                    {
                        eyre::bail!("num_compressors must be >= 1 when upload_compressors is set");
                    }
                    if c.compressor_bounce_n < 2 {
                        eyre::bail!("compressor_bounce_n must be >= 2");
                    }
                }
            }
            UploaderCfg::Leiden(c) => {
                if c.log_dir.is_empty() {
                    eyre::bail!("log_dir must be set");
                }
                if c.interval_s <= 0.0 || c.new_log_check_interval_s <= 0.0 {
                    eyre::bail!("intervals must be > 0");
                }
                if c.file_pattern.is_empty() {
                    eyre::bail!("file_pattern must be set");
                }
                if c.sensors.is_empty() {
                    eyre::bail!("sensors must not be empty");
                }
                if c.sensors.values().any(|col| *col == 0) {
                    eyre::bail!("sensor columns start at 1; column 0 is the timestamp");
                }
            }
            UploaderCfg::Avs47(c) => {
                if c.port.is_empty() {
                    eyre::bail!("port must be set");
                }
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.bitbang_delay_ms < 0.0 {
                    eyre::bail!("bitbang_delay_ms must be >= 0");
                }
                if c.quick_settle_points <= 1 {
                    eyre::bail!("quick_settle_points must be > 1");
                }
                if c.channels.is_empty() {
                    eyre::bail!("channels must not be empty");
                }
                for (ch, channel) in &c.channels {
                    if *ch > 7 {
                        eyre::bail!("channel {} out of range; the bridge has channels 0..=7", ch);
                    }
                    if channel.sensor.is_empty() {
                        eyre::bail!("channel {}: sensor name must be set", ch);
                    }
                    if self.curve(&channel.calibration).is_none() {
                        eyre::bail!(
                            "channel {}: unknown calibration '{}'; valid curves are: {}",
                            ch,
                            channel.calibration,
                            curve_names(self).join(", ")
                        );
                    }
                    if channel.average_count < 1 {
                        eyre::bail!("channel {}: average_count must be >= 1", ch);
                    }
                    if channel.average_delay_s < 0.01 {
                        eyre::bail!("channel {}: average_delay_s below the 10 ms minimum", ch);
                    }
                    if channel.settle_delay_s < 0.0 {
                        eyre::bail!("channel {}: settle_delay_s must be >= 0", ch);
                    }
                    if !curves::EXCITATIONS.contains(&channel.excitation.as_str()) {
                        eyre::bail!(
                            "channel {}: unknown excitation '{}'; valid values are: {}",
                            ch,
                            channel.excitation,
                            curves::EXCITATIONS.join(", ")
                        );
                    }
                }
            }
            UploaderCfg::Lakeshore336(c) => {
                if c.address.is_empty() {
                    eyre::bail!("address must be set");
                }
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.sensors.is_empty() {
                    eyre::bail!("sensors must not be empty");
                }
                for input in c.sensors.keys() {
                    if !matches!(input.as_str(), "A" | "B" | "C" | "D") {
                        eyre::bail!("unknown input '{}'; the 336 has inputs A..D", input);
                    }
                }
            }
            UploaderCfg::Cryomech(c) => {
                if c.address.is_empty() {
                    eyre::bail!("address must be set");
                }
                if c.version != "v1" {
                    eyre::bail!("unsupported compressor version '{}'; only v1 is implemented", c.version);
                }
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.use_calculated_bounce && c.compressor_bounce_n < 2 {
                    eyre::bail!("compressor_bounce_n must be >= 2 when use_calculated_bounce is set");
                }
            }
            UploaderCfg::MaxiGauge(c) => {
                if c.address.is_empty() {
                    eyre::bail!("address must be set");
                }
                if c.interval_s <= 0.0 {
                    eyre::bail!("interval_s must be > 0");
                }
                if c.sensors.is_empty() {
                    eyre::bail!("sensors must not be empty");
                }
                for ch in c.sensors.keys() {
                    if !(1..=6).contains(ch) {
                        eyre::bail!("gauge channel {} out of range; the MaxiGauge has channels 1..=6", ch);
                    }
                }
            }
        }
        Ok(())
    }
}

fn curve_names(cfg: &Config) -> Vec<String> {
    let mut names: Vec<String> = builtin_curves().keys().map(|s| s.to_string()).collect();
    names.extend(cfg.calibration.keys().cloned());
    names.sort();
    names.dedup();
    names
}
