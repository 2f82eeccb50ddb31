//! Exponential backoff with jitter.
//!
//! Waits grow geometrically up to a cap, and each sleep is jittered as
//! `wait / 2 + uniform(1, wait)` seconds so that several monitors knocked
//! over by the same outage do not hammer the server in lockstep.

use std::time::Duration;

use cryomon_traits::Clock;
use rand::Rng;

use crate::error::{Result, is_retryable};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub starting_wait: f64,
    pub multiplier: f64,
    pub max_wait: f64,
    /// 0 retries forever.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            starting_wait: 1.0,
            multiplier: 1.5,
            max_wait: 300.0,
            max_retries: 0,
        }
    }
}

impl RetryPolicy {
    /// Preset for instrument poll loops. Caps the wait low so a recovered
    /// instrument is picked up within one poll interval.
    pub fn poller() -> Self {
        Self {
            multiplier: 1.2,
            max_wait: 15.0,
            ..Self::default()
        }
    }
}

/// Tracks consecutive failures and produces the jittered wait for each.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    wait: f64,
    failures: u32,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            wait: policy.starting_wait,
            failures: 0,
        }
    }

    /// The wait before the next attempt, or `None` once the retry budget is
    /// spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.policy.max_retries > 0 && self.failures >= self.policy.max_retries {
            return None;
        }
        self.failures += 1;
        let w = self.wait;
        self.wait = (self.wait * self.policy.multiplier).min(self.policy.max_wait);
        Some(Duration::from_secs_f64(jitter(w)))
    }

    /// Call after a success so the next failure starts from scratch.
    pub fn reset(&mut self) {
        self.wait = self.policy.starting_wait;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

fn jitter(wait: f64) -> f64 {
    let (lo, hi) = if wait < 1.0 { (wait, 1.0) } else { (1.0, wait) };
    let uniform = if lo < hi {
        rand::thread_rng().gen_range(lo..hi)
    } else {
        lo
    };
    wait / 2.0 + uniform
}

/// Run `f` until it succeeds, sleeping on `clock` between attempts.
///
/// Errors that [`is_retryable`] rules permanent are returned immediately;
/// so is the last error once `max_retries` is exhausted.
pub fn retry_with<T, F>(policy: RetryPolicy, clock: &dyn Clock, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut schedule = RetrySchedule::new(policy);
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                let Some(wait) = schedule.next_wait() else {
                    return Err(e);
                };
                tracing::error!(
                    error = format!("{e:#}"),
                    attempt = schedule.failures(),
                    wait_s = wait.as_secs_f64(),
                    "{what} failed, retrying"
                );
                clock.sleep(wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use crate::mocks::FakeClock;

    #[test]
    fn succeeds_after_transient_failures() {
        let clock = FakeClock::new();
        let mut left = 2;
        let v = retry_with(RetryPolicy::default(), &clock, "op", || {
            if left > 0 {
                left -= 1;
                eyre::bail!("flaky");
            }
            Ok(7)
        })
        .unwrap();
        assert_eq!(v, 7);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        // First wait is exactly 1.0/2 + uniform(1,1) = 1.5 s.
        assert!((sleeps[0].as_secs_f64() - 1.5).abs() < 1e-9);
        // Second wait comes from w=1.5: in [1.75, 2.25).
        let s = sleeps[1].as_secs_f64();
        assert!((1.75..2.25).contains(&s), "unexpected wait {s}");
    }

    #[test]
    fn wait_growth_caps_at_max() {
        let mut sched = RetrySchedule::new(RetryPolicy {
            starting_wait: 100.0,
            multiplier: 10.0,
            max_wait: 300.0,
            max_retries: 0,
        });
        // Waits derive from 100, then 300, then 300 again.
        let w1 = sched.next_wait().unwrap().as_secs_f64();
        let w2 = sched.next_wait().unwrap().as_secs_f64();
        let w3 = sched.next_wait().unwrap().as_secs_f64();
        assert!((51.0..150.0).contains(&w1));
        assert!((151.0..450.0).contains(&w2));
        assert!((151.0..450.0).contains(&w3));
    }

    #[test]
    fn retry_budget_returns_last_error() {
        let clock = FakeClock::new();
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let err = retry_with::<(), _>(policy, &clock, "op", || {
            calls += 1;
            eyre::bail!("always down")
        })
        .unwrap_err();
        assert_eq!(calls, 3); // initial + 2 retries
        assert!(format!("{err}").contains("always down"));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let clock = FakeClock::new();
        let mut calls = 0;
        let err = retry_with::<(), _>(RetryPolicy::default(), &clock, "op", || {
            calls += 1;
            Err(eyre::Report::new(UploadError::Status {
                status: 404,
                body: "unknown fridge".into(),
            }))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
        assert!(format!("{err}").contains("404"));
    }

    #[test]
    fn schedule_reset_restarts_backoff() {
        let mut sched = RetrySchedule::new(RetryPolicy::poller());
        sched.next_wait();
        sched.next_wait();
        assert_eq!(sched.failures(), 2);
        sched.reset();
        assert_eq!(sched.failures(), 0);
        let w = sched.next_wait().unwrap().as_secs_f64();
        assert!((w - 1.5).abs() < 1e-9);
    }
}
