//! Reconnection policy for dead or never-opened frame sources.
//!
//! The session runs at most one reconnect attempt per frame request. Each
//! attempt waits the current backoff, then reopens the source descriptor.
//! `ReconnectTracker` carries the consecutive-failure count that drives the
//! backoff schedule and the optional give-up threshold.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::Duration;

/// Backoff schedule and give-up threshold.
///
/// The default is a fixed one-second backoff with no attempt limit.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    /// Growth factor applied per consecutive failure; 1.0 keeps the backoff fixed.
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Consecutive failed attempts after which the device is declared unavailable.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self {
            initial_backoff: backoff,
            multiplier: 1.0,
            max_backoff: backoff,
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial_backoff: initial,
            multiplier,
            max_backoff: max,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(anyhow!("reconnect multiplier must be >= 1.0"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(anyhow!("reconnect max backoff must be >= initial backoff"));
        }
        if self.max_attempts == Some(0) {
            return Err(anyhow!("reconnect max attempts must be > 0"));
        }
        Ok(())
    }

    /// Wait before the attempt that follows `consecutive_failures` failed ones.
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let factor = self.multiplier.powi(consecutive_failures.min(64) as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor).round();
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// Where the device stands from the session's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Connected,
    Reconnecting,
    /// Gave up after `max_attempts`; no further attempts until reset.
    Unavailable,
}

/// Per-session reconnect bookkeeping.
#[derive(Clone, Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    total_attempts: u64,
    gave_up: bool,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            total_attempts: 0,
            gave_up: false,
        }
    }

    /// Backoff to sleep before the next attempt. Counts the attempt.
    pub fn begin_attempt(&mut self) -> Duration {
        self.total_attempts += 1;
        self.policy.backoff_for(self.consecutive_failures)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.gave_up = false;
    }

    /// Returns true when this failure exhausted the attempt budget.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.consecutive_failures >= max {
                self.gave_up = true;
            }
        }
        self.gave_up
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.gave_up = false;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_one_second() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, None);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
        );
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let shrinking = ReconnectPolicy::exponential(
            Duration::from_secs(1),
            0.5,
            Duration::from_secs(2),
        );
        assert!(shrinking.validate().is_err());

        let inverted = ReconnectPolicy::exponential(
            Duration::from_secs(2),
            2.0,
            Duration::from_secs(1),
        );
        assert!(inverted.validate().is_err());

        let zero = ReconnectPolicy::default().with_max_attempts(0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn tracker_gives_up_after_max_attempts() {
        let mut tracker =
            ReconnectTracker::new(ReconnectPolicy::fixed(Duration::ZERO).with_max_attempts(3));
        for _ in 0..2 {
            tracker.begin_attempt();
            assert!(!tracker.record_failure());
        }
        tracker.begin_attempt();
        assert!(tracker.record_failure());
        assert_eq!(tracker.total_attempts(), 3);

        tracker.reset();
        assert_eq!(tracker.consecutive_failures(), 0);
        tracker.begin_attempt();
        assert!(!tracker.record_failure());
    }

    #[test]
    fn success_resets_backoff_schedule() {
        let mut tracker = ReconnectTracker::new(ReconnectPolicy::exponential(
            Duration::from_millis(10),
            3.0,
            Duration::from_secs(1),
        ));
        tracker.begin_attempt();
        tracker.record_failure();
        assert_eq!(tracker.begin_attempt(), Duration::from_millis(30));
        tracker.record_success();
        assert_eq!(tracker.begin_attempt(), Duration::from_millis(10));
    }

    #[test]
    fn unlimited_policy_never_gives_up() {
        let mut tracker = ReconnectTracker::new(ReconnectPolicy::fixed(Duration::ZERO));
        for _ in 0..1000 {
            tracker.begin_attempt();
            assert!(!tracker.record_failure());
        }
    }
}
