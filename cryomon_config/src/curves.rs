//! Resistance→temperature calibration curves.
//!
//! Each curve is a power-series polynomial fit. Evaluation maps the input
//! (optionally `log10(R)`) into the fit's domain window `[-1, 1]`, runs the
//! polynomial, optionally un-logs the result, and scales it into Kelvin.
//! Inputs or outputs outside the curve's validity ranges yield `None`,
//! meaning "out of calibrated range" rather than an error.
//!
//! The built-in tables were fit against `log10(R)` over their natural window,
//! so they carry the identity domain `[-1, 1]` and a `1e-3` scale (the fits
//! produce millikelvin).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Deserialize;

/// Excitation voltage labels accepted by the resistance bridge.
pub const EXCITATIONS: [&str; 8] = ["0", "3uV", "10uV", "30uV", "100uV", "300uV", "1mV", "3mV"];

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationCurve {
    /// Evaluate the polynomial in `log10(R)` rather than R.
    #[serde(default = "yes")]
    pub log_r: bool,
    /// The polynomial yields `log10(T)`; un-log before scaling.
    #[serde(default = "yes")]
    pub log_t: bool,
    /// Multiplier taking the (un-logged) result to Kelvin.
    #[serde(default = "milli")]
    pub scale: f64,
    /// Inclusive resistance validity bounds in Ohms.
    #[serde(default = "any_resistance")]
    pub resistance_range: [f64; 2],
    /// Inclusive temperature validity bounds in Kelvin.
    #[serde(default = "any_temperature")]
    pub temperature_range: [f64; 2],
    /// Window the polynomial was fit over; inputs map affinely onto `[-1, 1]`.
    #[serde(default = "identity_domain")]
    pub domain: [f64; 2],
    /// Ascending powers: `c[0] + c[1]*u + c[2]*u^2 + ...`.
    pub coefficients: Vec<f64>,
}

fn yes() -> bool {
    true
}
fn milli() -> f64 {
    1e-3
}
fn any_resistance() -> [f64; 2] {
    [1e-1, 1e8]
}
fn any_temperature() -> [f64; 2] {
    [1e-5, 1e4]
}
fn identity_domain() -> [f64; 2] {
    [-1.0, 1.0]
}

impl CalibrationCurve {
    /// Structural sanity for user-supplied curves.
    pub fn check(&self) -> Result<(), String> {
        if self.coefficients.is_empty() {
            return Err("coefficients must not be empty".into());
        }
        if self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err("coefficients must be finite".into());
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err("scale must be a positive finite number".into());
        }
        for (name, range) in [
            ("resistance_range", &self.resistance_range),
            ("temperature_range", &self.temperature_range),
            ("domain", &self.domain),
        ] {
            if !(range[0].is_finite() && range[1].is_finite() && range[0] < range[1]) {
                return Err(format!("{name} must be an ordered pair of finite numbers"));
            }
        }
        if self.log_r && self.resistance_range[0] <= 0.0 {
            return Err("resistance_range must be positive for log-resistance curves".into());
        }
        Ok(())
    }

    /// Convert a resistance in Ohms to a temperature in Kelvin.
    ///
    /// `None` means the resistance or the computed temperature falls outside
    /// the curve's validity bounds. Bounds are inclusive so a reading sitting
    /// exactly on the edge still converts.
    pub fn temperature(&self, resistance: f64) -> Option<f64> {
        if !resistance.is_finite() {
            return None;
        }
        if resistance < self.resistance_range[0] || resistance > self.resistance_range[1] {
            return None;
        }
        let x = if self.log_r { resistance.log10() } else { resistance };
        let [d0, d1] = self.domain;
        let u = 2.0 * (x - d0) / (d1 - d0) - 1.0;
        let mut t = 0.0;
        for &c in self.coefficients.iter().rev() {
            t = t * u + c;
        }
        if self.log_t {
            t = 10f64.powf(t);
        }
        t *= self.scale;
        if !t.is_finite() || t < self.temperature_range[0] || t > self.temperature_range[1] {
            return None;
        }
        Some(t)
    }
}

/// Curves shipped with the daemon, keyed by the names config files use.
pub fn builtin_curves() -> &'static BTreeMap<&'static str, CalibrationCurve> {
    static CURVES: OnceLock<BTreeMap<&'static str, CalibrationCurve>> = OnceLock::new();
    CURVES.get_or_init(|| {
        let mut m = BTreeMap::new();
        m.insert("PT1000", polylog(vec![
            -128_349.515_953_672,
            569_881.315_037_663,
            -1_110_371.167_706_21,
            1_246_176.897_225_44,
            -887_917.400_767_292,
            416_637.746_192_204,
            -128_790.025_704_277,
            25_299.624_652_812,
            -2_867.046_948_082,
            142.875_821_665,
        ]));
        m.insert("RuO_10K", polylog(vec![
            6_909.149_278,
            -38_314.105_97,
            93_795.121_72,
            -132_881.190_7,
            120_024.664_2,
            -71_674.983_8,
            28_300.344_47,
            -7_125.704_6,
            1_038.446_473,
            -66.754_799_13,
        ]));
        m.insert("RuO_1K5", polylog(vec![
            -109_406_225.453_069,
            264_570_367.275_206,
            -284_130_767.924_156,
            177_858_095.325_872,
            -71_516_430.047_720_8,
            19_156_216.603_866_6,
            -3_418_108.547_216_48,
            391_778.170_838_493,
            -26_174.321_297_539_8,
            776.590_777_082_747,
        ]));
        m.insert("S0923", polylog(vec![
            10_379.934_115_782,
            -19_555.766_089_189,
            15_743.547_719_455,
            -7_015.940_352_528,
            1_868.772_009_588,
            -297.498_475_028,
            26.208_557_355,
            -0.985_676_217,
        ]));
        m.insert("TT_1326", polylog(vec![
            -81_196.216_513_775_4,
            160_882.256_332_658_9,
            -138_861.512_011_207_8,
            68_220.570_158_686,
            -20_871.311_479_172_8,
            4_072.737_692_808_4,
            -495.124_485_137_4,
            34.292_242_550_9,
            -1.036_145_763_3,
        ]));
        m
    })
}

fn polylog(coefficients: Vec<f64>) -> CalibrationCurve {
    CalibrationCurve {
        log_r: true,
        log_t: true,
        scale: 1e-3,
        resistance_range: any_resistance(),
        temperature_range: any_temperature(),
        domain: identity_domain(),
        coefficients,
    }
}
