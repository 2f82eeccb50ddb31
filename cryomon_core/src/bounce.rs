//! Compressor bounce estimation.
//!
//! "Bounce" is the peak-to-peak wobble on the helium pressure lines as the
//! displacer cycles. Newer compressors report it; older ones only report
//! smoothed pressures, so we reconstruct it from a short pressure history:
//! zero-mean the window, take the analytic signal via a Hilbert transform,
//! and report twice the median of the envelope.
//!
//! The DFT here is the naive O(N^2) orthonormal form (1/sqrt(N) each way).
//! Windows are tens of points, so this costs microseconds and saves an FFT
//! dependency.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn scale(self, s: f64) -> Self {
        Self {
            re: self.re * s,
            im: self.im * s,
        }
    }

    fn abs(&self) -> f64 {
        self.re.hypot(self.im)
    }
}

fn dft(input: &[Complex], inverse: bool) -> Vec<Complex> {
    let n = input.len();
    let norm = (n as f64).sqrt();
    let phase = if inverse { 1.0 } else { -1.0 };
    let mut out = vec![Complex::default(); n];
    for (k, out_k) in out.iter_mut().enumerate() {
        let mut acc = Complex::default();
        for (i, x) in input.iter().enumerate() {
            let angle = phase * std::f64::consts::TAU * (k * i) as f64 / n as f64;
            let (sin, cos) = angle.sin_cos();
            acc.re += x.re * cos - x.im * sin;
            acc.im += x.re * sin + x.im * cos;
        }
        *out_k = acc.scale(1.0 / norm);
    }
    out
}

/// Peak-to-peak amplitude estimate of `samples` via the Hilbert envelope.
///
/// Returns 0 for constant input (the envelope of a zero signal is zero) and
/// for fewer than two samples.
pub fn hilbert_amplitude(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let mean = samples.iter().sum::<f64>() / n as f64;
    let centered: Vec<Complex> = samples
        .iter()
        .map(|&x| Complex {
            re: x - mean,
            im: 0.0,
        })
        .collect();
    let spectrum = dft(&centered, false);

    // Keep DC and (for even N) Nyquist, double positive frequencies, zero
    // the negative half.
    let mut filtered = vec![Complex::default(); n];
    filtered[0] = spectrum[0];
    let positive = if n % 2 == 0 {
        filtered[n / 2] = spectrum[n / 2];
        1..n / 2
    } else {
        1..n.div_ceil(2)
    };
    for i in positive {
        filtered[i] = spectrum[i].scale(2.0);
    }
    let analytic = dft(&filtered, true);

    let mut envelope: Vec<f64> = analytic.iter().map(Complex::abs).collect();
    envelope.sort_by(f64::total_cmp);
    2.0 * envelope[envelope.len() / 2]
}

/// Fixed-size pressure history for one compressor line.
///
/// The estimate is only defined once the window has filled; before that a
/// partial window would bias the median low.
#[derive(Debug, Clone)]
pub struct BounceWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl BounceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Drop history, e.g. after an instrument reconnect where the gap would
    /// masquerade as a pressure swing.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn amplitude(&self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        Some(hilbert_amplitude(&samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, cycles: usize, amplitude: f64, offset: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                offset
                    + amplitude * (std::f64::consts::TAU * (cycles * i) as f64 / n as f64).sin()
            })
            .collect()
    }

    #[test]
    fn sine_recovers_peak_to_peak() {
        // A pure tone on a DFT bin has a flat envelope equal to its amplitude,
        // so the estimate is the full swing.
        for n in [16usize, 15, 32] {
            let x = sine(n, 3, 0.7, 0.0);
            let amp = hilbert_amplitude(&x);
            assert!((amp - 1.4).abs() < 1e-9, "n={n}: got {amp}");
        }
    }

    #[test]
    fn dc_offset_is_ignored() {
        let centered = hilbert_amplitude(&sine(16, 2, 0.5, 0.0));
        let offset = hilbert_amplitude(&sine(16, 2, 0.5, 230.0));
        assert!((centered - offset).abs() < 1e-9);
    }

    #[test]
    fn constant_signal_has_zero_bounce() {
        assert_eq!(hilbert_amplitude(&[101.5; 15]), 0.0);
        assert_eq!(hilbert_amplitude(&[3.0]), 0.0);
        assert_eq!(hilbert_amplitude(&[]), 0.0);
    }

    #[test]
    fn window_defined_only_when_full() {
        let mut w = BounceWindow::new(4);
        assert!(w.amplitude().is_none());
        for v in [1.0, 2.0, 1.0] {
            w.push(v);
        }
        assert!(w.amplitude().is_none());
        w.push(2.0);
        assert!(w.is_full());
        assert!(w.amplitude().is_some());
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = BounceWindow::new(3);
        for v in [10.0, 20.0, 30.0, 40.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        let samples: Vec<f64> = w.samples.iter().copied().collect();
        assert_eq!(samples, vec![20.0, 30.0, 40.0]);
    }

    #[test]
    fn clear_empties_history() {
        let mut w = BounceWindow::new(2);
        w.push(1.0);
        w.push(2.0);
        assert!(w.is_full());
        w.clear();
        assert!(w.is_empty());
        assert!(w.amplitude().is_none());
    }
}
