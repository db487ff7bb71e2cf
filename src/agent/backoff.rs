//! Exponential backoff with full jitter
//!
//! The engine only computes delays; the caller sleeps.

use std::time::Duration;
use tracing::{info, warn};

/// Next step of a retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep for `delay`, then make attempt number `attempt` (1-based).
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

/// Retry context for one reconnect sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts_done: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempts_done: 0,
        }
    }

    pub fn attempts_done(&self) -> u32 {
        self.attempts_done
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the next delay: `min(base << attempts_done, max)`.
    pub fn ceiling(&self) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shifted = if self.attempts_done >= 63 {
            u64::MAX
        } else {
            base_ms.saturating_mul(1u64 << self.attempts_done)
        };
        Duration::from_millis(shifted.min(max_ms))
    }

    /// Compute the next delay from a caller-supplied random value.
    ///
    /// The delay is uniform in `[0, ceiling]` as `random % (ceiling + 1)`.
    pub fn next_delay(&mut self, random: u32) -> BackoffStep {
        if self.attempts_done >= self.max_attempts {
            warn!(
                "All reconnection attempts exhausted ({}/{})",
                self.attempts_done, self.max_attempts
            );
            return BackoffStep::Exhausted;
        }

        let ceiling_ms = self.ceiling().as_millis() as u64;
        let delay = Duration::from_millis(u64::from(random) % (ceiling_ms + 1));
        self.attempts_done += 1;

        info!(
            "Backing off {}ms before attempt {}/{}",
            delay.as_millis(),
            self.attempts_done,
            self.max_attempts
        );
        BackoffStep::Retry {
            attempt: self.attempts_done,
            delay,
        }
    }

    /// [`next_delay`](Self::next_delay) with a value from the thread RNG.
    pub fn next_random(&mut self) -> BackoffStep {
        self.next_delay(rand::random::<u32>())
    }

    pub fn reset(&mut self) {
        self.attempts_done = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn default_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(500), Duration::from_millis(5000), 5)
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let mut backoff = default_backoff();
        let mut ceilings = Vec::new();
        loop {
            ceilings.push(backoff.ceiling().as_millis());
            if backoff.next_delay(0) == BackoffStep::Exhausted {
                break;
            }
        }
        assert_eq!(ceilings, vec![500, 1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let mut backoff = default_backoff();
        for expected in 1..=5 {
            match backoff.next_delay(7) {
                BackoffStep::Retry { attempt, .. } => assert_eq!(attempt, expected),
                BackoffStep::Exhausted => panic!("exhausted early at {expected}"),
            }
        }
        assert_eq!(backoff.next_delay(7), BackoffStep::Exhausted);
        assert_eq!(backoff.attempts_done(), 5);
    }

    #[test]
    fn test_jitter_is_random_mod_ceiling_plus_one() {
        let mut backoff = default_backoff();
        assert_eq!(
            backoff.next_delay(501),
            BackoffStep::Retry {
                attempt: 1,
                delay: Duration::from_millis(0)
            }
        );
        assert_eq!(
            backoff.next_delay(1000),
            BackoffStep::Retry {
                attempt: 2,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_zero_attempts_is_immediately_exhausted() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(10), 0);
        assert_eq!(backoff.next_random(), BackoffStep::Exhausted);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = default_backoff();
        backoff.next_delay(0);
        backoff.next_delay(0);
        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_ceiling(random in any::<u32>(), done in 0u32..40) {
            let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(5000), 64);
            for _ in 0..done {
                backoff.next_delay(0);
            }
            let ceiling = backoff.ceiling();
            match backoff.next_delay(random) {
                BackoffStep::Retry { delay, .. } => prop_assert!(delay <= ceiling),
                BackoffStep::Exhausted => prop_assert!(false, "unexpected exhaustion"),
            }
        }
    }
}
