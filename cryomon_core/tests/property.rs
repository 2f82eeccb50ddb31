//! Invariants checked over generated inputs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use cryomon_core::bounce::hilbert_amplitude;
use cryomon_core::logtail::ScalarCursor;
use cryomon_core::mocks::FakeClock;
use cryomon_core::retry::{RetryPolicy, RetrySchedule};
use cryomon_traits::Clock;
use proptest::prelude::*;
use tempfile::tempdir;

fn append_bytes(path: &Path, bytes: &[u8]) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(bytes).unwrap();
}

proptest! {
    // The bounce estimate feeds off absolute pressures (hundreds of psi);
    // the wobble itself is a few psi. Any dependence on the DC level would
    // swamp the signal.
    #[test]
    fn bounce_ignores_the_dc_pressure_level(
        samples in prop::collection::vec(-100.0f64..100.0, 4..24),
        offset in -1.0e4f64..1.0e4,
    ) {
        let base = hilbert_amplitude(&samples);
        let shifted: Vec<f64> = samples.iter().map(|v| v + offset).collect();
        let moved = hilbert_amplitude(&shifted);
        let tol = 1e-6 * (1.0 + base.abs() + offset.abs());
        prop_assert!((base - moved).abs() <= tol, "{} vs {}", base, moved);
    }

    #[test]
    fn bounce_scales_linearly_with_the_signal(
        samples in prop::collection::vec(-100.0f64..100.0, 4..24),
        k in 0.1f64..50.0,
    ) {
        let base = hilbert_amplitude(&samples);
        let scaled: Vec<f64> = samples.iter().map(|v| v * k).collect();
        let got = hilbert_amplitude(&scaled);
        let tol = 1e-6 * (1.0 + base * k);
        prop_assert!((got - base * k).abs() <= tol, "{} vs {}", got, base * k);
    }

    // A spent budget must be exact: the supervisor counts on None to tell
    // a struggling poller from a dead one.
    #[test]
    fn retry_budget_is_exact_and_waits_are_bounded(
        starting in 0.1f64..10.0,
        multiplier in 1.0f64..3.0,
        max_wait in 10.0f64..100.0,
        budget in 1u32..12,
    ) {
        let policy = RetryPolicy {
            starting_wait: starting,
            multiplier,
            max_wait,
            max_retries: budget,
        };
        let mut sched = RetrySchedule::new(policy);
        for _ in 0..budget {
            let wait = sched.next_wait();
            prop_assert!(wait.is_some());
            let secs = wait.unwrap().as_secs_f64();
            prop_assert!(secs > 0.0);
            // jitter(w) < w/2 + max(w, 1), and w never exceeds max_wait.
            prop_assert!(secs <= max_wait / 2.0 + max_wait.max(1.0) + 1e-9, "wait {}", secs);
        }
        prop_assert_eq!(sched.next_wait(), None);
        prop_assert_eq!(sched.failures(), budget);

        sched.reset();
        prop_assert!(sched.next_wait().is_some());
    }

    // Vendor software writes lines in whatever flushes its buffers produce.
    // However the bytes arrive, the cursor must yield exactly the complete
    // lines, in order, with no duplicates or tears.
    #[test]
    fn scalar_cursor_is_chunking_invariant(
        values in prop::collection::vec(-1.0e3f64..1.0e3, 1..16),
        sizes in prop::collection::vec(1usize..9, 1..32),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CH6 T 25-08-22.log");

        let mut text = String::new();
        for (i, v) in values.iter().enumerate() {
            let secs = i as u32;
            text.push_str(&format!("22-08-25,12:{:02}:{:02},{}\n", secs / 60, secs % 60, v));
        }

        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(FakeClock::new());
        let mut cursor = ScalarCursor::new(&path, clock, Duration::from_secs(1800));

        let bytes = text.as_bytes();
        let mut got = Vec::new();
        let mut pos = 0;
        let mut size_iter = sizes.iter().cycle();
        while pos < bytes.len() {
            let take = (*size_iter.next().unwrap()).min(bytes.len() - pos);
            append_bytes(&path, &bytes[pos..pos + take]);
            pos += take;
            while let Some(entry) = cursor.pop().unwrap() {
                got.push(entry);
            }
        }

        prop_assert_eq!(got.len(), values.len());
        for (i, (time, value)) in got.iter().enumerate() {
            let secs = i as u32;
            let expected = NaiveDate::from_ymd_opt(2025, 8, 22)
                .unwrap()
                .and_hms_opt(12, secs / 60, secs % 60)
                .unwrap();
            prop_assert_eq!(*time, expected);
            prop_assert_eq!(*value, values[i]);
        }
    }
}
