//! Retry delay policy
//!
//! Decides how long to wait before re-running a sync pass that ended with
//! retryable failures. Delays are whole milliseconds with no jitter.

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;
use std::time::Duration;

/// How retry delays grow between consecutive failed passes
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Same delay every time
    Fixed(Duration),

    /// Delay multiplied after each failed pass, capped at `max`
    Exponential {
        /// First delay
        initial: Duration,
        /// Growth factor
        multiplier: f64,
        /// Upper bound
        max: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            max: Duration::from_secs(300),
        }
    }
}

impl RetryStrategy {
    /// Start a fresh schedule for this strategy
    pub fn schedule(&self) -> RetrySchedule {
        let backoff: Box<dyn Backoff + Send> = match *self {
            RetryStrategy::Fixed(delay) => Box::new(Constant::new(delay)),
            RetryStrategy::Exponential { initial, multiplier, max } => {
                Box::new(ExponentialBackoff {
                    current_interval: initial,
                    initial_interval: initial,
                    randomization_factor: 0.0,
                    multiplier,
                    max_interval: max,
                    max_elapsed_time: None,
                    ..Default::default()
                })
            }
        };
        RetrySchedule { backoff, fallback: self.floor() }
    }

    fn floor(&self) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, .. } => *initial,
        }
    }
}

/// Stateful sequence of retry delays
pub struct RetrySchedule {
    backoff: Box<dyn Backoff + Send>,
    fallback: Duration,
}

impl RetrySchedule {
    /// Delay before the next retry; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.next_backoff().unwrap_or(self.fallback);
        Duration::from_millis(delay.as_millis() as u64)
    }

    /// Return to the first delay
    pub fn reset(&mut self) {
        self.backoff.reset();
    }
}

impl std::fmt::Debug for RetrySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySchedule")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_never_changes() {
        let mut schedule = RetryStrategy::Fixed(Duration::from_secs(5)).schedule();
        for _ in 0..4 {
            assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let mut schedule = RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(5),
        }
        .schedule();

        let delays: Vec<u64> = (0..5).map(|_| schedule.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut schedule = RetryStrategy::default().schedule();
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        assert_eq!(schedule.next_delay(), Duration::from_secs(10));

        schedule.reset();
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
    }
}
