//! Backoff delay computation.
//!
//! All functions take the 1-based count of consecutive failures, `n`. The base
//! delay is `backoff[min(n - 1, len - 1)]`, so the last table entry repeats
//! once the table runs out. A strategy with a cap `C` is exhausted at
//! failure `C + 1`.

use std::time::Duration;

use rand::Rng;

use crate::core::{CONCEAL_IS_INCLUSIVE, MAX_JITTER_PERCENT};
use crate::policy::RetryStrategy;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait and try again.
    Wait {
        /// Table delay before jitter.
        base: Duration,
        /// Delay to actually wait.
        delay: Duration,
    },
    /// No further attempts.
    Exhausted,
}

/// Base delay (before jitter) after the `failures`-th consecutive failure.
pub fn base_delay(strategy: &RetryStrategy, failures: u32) -> Duration {
    let table = strategy.backoff_ms();
    let index = (failures.saturating_sub(1) as usize).min(table.len().saturating_sub(1));
    table
        .get(index)
        .map(|&ms| Duration::from_millis(u64::from(ms)))
        .unwrap_or_default()
}

/// Spread `base` uniformly over `base ± percent%`.
pub fn apply_jitter<R: Rng + ?Sized>(base: Duration, percent: u8, rng: &mut R) -> Duration {
    let ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let percent = u64::from(percent.min(MAX_JITTER_PERCENT));
    let span = ms.saturating_mul(percent) / 100;
    if span == 0 {
        return base;
    }
    let offset = rng.gen_range(0..=span * 2);
    Duration::from_millis((ms - span).saturating_add(offset))
}

/// Whether the strategy's retry cap has been exceeded.
pub fn is_exhausted(strategy: &RetryStrategy, failures: u32) -> bool {
    matches!(strategy.limit, Some(cap) if failures > cap)
}

/// Whether the `failures`-th consecutive failure is hidden from the
/// application.
pub fn is_concealed(strategy: &RetryStrategy, failures: u32) -> bool {
    let conceal = u32::from(strategy.conceal);
    if CONCEAL_IS_INCLUSIVE {
        failures <= conceal
    } else {
        failures < conceal
    }
}

/// Decide the next step after the `failures`-th consecutive failure.
pub fn next_action<R: Rng + ?Sized>(
    strategy: &RetryStrategy,
    failures: u32,
    rng: &mut R,
) -> RetryAction {
    if is_exhausted(strategy, failures) {
        return RetryAction::Exhausted;
    }
    let base = base_delay(strategy, failures);
    RetryAction::Wait {
        base,
        delay: apply_jitter(base, strategy.jitter_percent(), rng),
    }
}
