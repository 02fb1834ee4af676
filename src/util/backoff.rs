//! Exponential backoff with jitter for transient I/O failures.

use rand::Rng;
use std::time::Duration;

/// Retry policy: base 1s, doubling per attempt, capped at 60s, at most 10
/// attempts before the failure is escalated from warning to critical.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: 10,
            attempt: 0,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the attempt budget is spent; callers escalate to critical.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: `base * multiplier^attempt`, capped, with up to 50%
    /// additive jitter so a fleet of retrying clients does not stampede.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        Duration::from_millis((capped * (1.0 + jitter)).min(self.cap.as_millis() as f64) as u64)
    }
}
