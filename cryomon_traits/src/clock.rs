use std::thread;
use std::time::{Duration, Instant};

/// Monotonic clock abstraction for waits and elapsed-time checks.
///
/// - now(): returns a monotonic Instant
/// - sleep(): sleeps for the provided duration (implementations may simulate)
/// - elapsed_secs(): seconds elapsed since an epoch Instant
///
/// Settle timers, bit-bang delays and retry backoff all sleep through this
/// trait so tests can run them without wall-clock time passing.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Seconds elapsed since `epoch`, saturating at 0 on underflow.
    fn elapsed_secs(&self, epoch: Instant) -> f64 {
        self.now().saturating_duration_since(epoch).as_secs_f64()
    }
}

/// Default, real-time monotonic clock backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_secs_saturates_at_zero() {
        let clock = MonotonicClock::new();
        let future = clock.now() + Duration::from_secs(60);
        assert_eq!(clock.elapsed_secs(future), 0.0);
    }

    #[test]
    fn elapsed_secs_counts_forward() {
        let clock = MonotonicClock::new();
        let epoch = clock.now() - Duration::from_millis(1500);
        let secs = clock.elapsed_secs(epoch);
        assert!(secs >= 1.5);
    }
}
