//! Jittered exponential backoff for retrying directory requests. Unbounded:
//! callers retry until they succeed or are cancelled.

use std::time::Duration;

use rand::Rng;

const INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_INTERVAL: Duration = Duration::from_secs(60);
const MULTIPLIER: f64 = 1.5;
const RANDOMIZATION: f64 = 0.5;

/// Backoff state. Create one per retry sequence; it is never shared.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    multiplier: f64,
    randomization: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_params(INITIAL_INTERVAL, MAX_INTERVAL, MULTIPLIER, RANDOMIZATION)
    }

    pub fn with_params(
        initial: Duration,
        max: Duration,
        multiplier: f64,
        randomization: f64,
    ) -> Self {
        Self {
            max,
            multiplier: multiplier.max(1.0),
            randomization: randomization.clamp(0.0, 1.0),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt: the current interval randomized by
    /// ±`randomization`, after which the interval grows up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let delta = base.as_secs_f64() * self.randomization;
        let delay = if delta > 0.0 {
            let secs = base.as_secs_f64();
            Duration::from_secs_f64(rand::thread_rng().gen_range((secs - delta)..=(secs + delta)))
        } else {
            base
        };
        self.current = base.mul_f64(self.multiplier).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
