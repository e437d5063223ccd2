//! Per-session retry bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::backoff::{RetryAction, is_concealed, next_action};
use crate::policy::RetryStrategy;

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Re-attempt after `delay`.
    Retry {
        /// Jittered delay.
        delay: Duration,
        /// Table delay before jitter.
        base: Duration,
        /// Whether the application should hear about this failure.
        visible: bool,
    },
    /// Retries are used up.
    Exhausted,
}

/// Attempt and failure counters for one session.
#[derive(Debug)]
pub struct RetryTracker {
    strategy: Arc<RetryStrategy>,
    rng: StdRng,
    consecutive_failures: u32,
    total_attempts: u32,
}

impl RetryTracker {
    /// Track attempts under `strategy`.
    ///
    /// A fixed `seed` makes the jitter sequence reproducible.
    pub fn new(strategy: Arc<RetryStrategy>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            strategy,
            rng,
            consecutive_failures: 0,
            total_attempts: 0,
        }
    }

    /// Record the start of an attempt and return its 1-based number.
    pub fn on_attempt(&mut self) -> u32 {
        self.total_attempts = self.total_attempts.saturating_add(1);
        self.total_attempts
    }

    /// Record a failed attempt.
    pub fn on_failure(&mut self) -> FailureVerdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;

        match next_action(&self.strategy, failures, &mut self.rng) {
            RetryAction::Wait { base, delay } => FailureVerdict::Retry {
                delay,
                base,
                visible: !is_concealed(&self.strategy, failures),
            },
            RetryAction::Exhausted => FailureVerdict::Exhausted,
        }
    }

    /// Record a successful connection.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Attempts started over the session's life.
    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Strategy being applied.
    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(strategy: RetryStrategy) -> RetryTracker {
        RetryTracker::new(Arc::new(strategy), Some(0))
    }

    #[test]
    fn test_concealed_then_visible() {
        let mut tracker = tracker(
            RetryStrategy::new("r", vec![100, 200]).unwrap().with_conceal(2),
        );

        let visible: Vec<bool> = (0..4)
            .map(|_| match tracker.on_failure() {
                FailureVerdict::Retry { visible, .. } => visible,
                FailureVerdict::Exhausted => panic!("uncapped strategy exhausted"),
            })
            .collect();
        assert_eq!(visible, vec![false, false, true, true]);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut tracker = tracker(RetryStrategy::new("r", vec![100, 200, 400]).unwrap());

        tracker.on_attempt();
        tracker.on_failure();
        tracker.on_attempt();
        tracker.on_failure();
        assert_eq!(tracker.consecutive_failures(), 2);

        tracker.on_attempt();
        tracker.on_success();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.total_attempts(), 3);

        assert_eq!(
            tracker.on_failure(),
            FailureVerdict::Retry {
                delay: Duration::from_millis(100),
                base: Duration::from_millis(100),
                visible: true
            }
        );
    }

    #[test]
    fn test_cap_counts_consecutive_failures() {
        let mut tracker = tracker(RetryStrategy::new("r", vec![10]).unwrap().with_limit(2));

        assert!(matches!(tracker.on_failure(), FailureVerdict::Retry { .. }));
        assert!(matches!(tracker.on_failure(), FailureVerdict::Retry { .. }));
        assert_eq!(tracker.on_failure(), FailureVerdict::Exhausted);
    }
}
