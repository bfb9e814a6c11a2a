//! Retry pacing strategies.
//!
//! A [`Strategy`] maps an attempt counter to a delay. The base strategies
//! (`Constant`, `Exponential`, `Cycle`) compose with `Maximum`, `Minimum`,
//! and `Jitter` wrappers.

use std::time::Duration;

use rand::Rng;

/// Computes how long to wait before retrying.
pub trait Strategy: Send + Sync {
    /// Delay before attempt number `attempt` (zero-based).
    fn backoff(&self, attempt: u32) -> Duration;
}

impl<F> Strategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn backoff(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Always returns the same duration.
pub fn constant(d: Duration) -> Constant {
    Constant(d)
}

#[derive(Debug, Clone, Copy)]
pub struct Constant(Duration);

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// `scale * 2^attempt`, saturating at `Duration::MAX` on overflow.
pub fn exponential(scale: Duration) -> Exponential {
    assert!(!scale.is_zero(), "exponential backoff can't be scaled by 0");
    Exponential(scale)
}

#[derive(Debug, Clone, Copy)]
pub struct Exponential(Duration);

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> Duration {
        if attempt >= 64 {
            return Duration::MAX;
        }
        self.0
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }
}

/// An explicit set of delays, restarting from the first once exhausted.
pub fn cycle(delays: Vec<Duration>) -> Cycle {
    assert!(!delays.is_empty(), "cycle requires at least one delay");
    Cycle(delays)
}

#[derive(Debug, Clone)]
pub struct Cycle(Vec<Duration>);

impl Strategy for Cycle {
    fn backoff(&self, attempt: u32) -> Duration {
        self.0[attempt as usize % self.0.len()]
    }
}

/// Upper-bounds a strategy.
pub struct Maximum<S>(pub S, pub Duration);

impl<S: Strategy> Strategy for Maximum<S> {
    fn backoff(&self, attempt: u32) -> Duration {
        self.0.backoff(attempt).min(self.1)
    }
}

/// Lower-bounds a strategy.
pub struct Minimum<S>(pub S, pub Duration);

impl<S: Strategy> Strategy for Minimum<S> {
    fn backoff(&self, attempt: u32) -> Duration {
        self.0.backoff(attempt).max(self.1)
    }
}

/// Adds up to `multiplier * delay` of random extra wait.
pub struct Jitter<S>(pub S, pub f64);

impl<S: Strategy> Strategy for Jitter<S> {
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.0.backoff(attempt);
        if base == Duration::MAX {
            return base;
        }
        let window = base.as_secs_f64() * self.1;
        if window <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rand::rng().random_range(0.0..window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_attempt() {
        let s = constant(Duration::from_secs(30));
        assert_eq!(s.backoff(0), Duration::from_secs(30));
        assert_eq!(s.backoff(100), Duration::from_secs(30));
    }

    #[test]
    fn exponential_doubles() {
        let s = exponential(Duration::from_secs(15));
        assert_eq!(s.backoff(0), Duration::from_secs(15));
        assert_eq!(s.backoff(1), Duration::from_secs(30));
        assert_eq!(s.backoff(8), Duration::from_secs(15 * 256));
    }

    #[test]
    fn exponential_saturates() {
        let s = exponential(Duration::from_secs(15));
        assert_eq!(s.backoff(200), Duration::MAX);
    }

    #[test]
    fn maximum_caps() {
        let s = Maximum(exponential(Duration::from_secs(15)), Duration::from_secs(60));
        assert_eq!(s.backoff(0), Duration::from_secs(15));
        assert_eq!(s.backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn minimum_floors() {
        let s = Minimum(constant(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(s.backoff(0), Duration::from_secs(5));
    }

    #[test]
    fn cycle_wraps() {
        let s = cycle(vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(s.backoff(0), Duration::from_secs(1));
        assert_eq!(s.backoff(1), Duration::from_secs(2));
        assert_eq!(s.backoff(2), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_window() {
        let s = Jitter(constant(Duration::from_secs(10)), 0.5);
        for attempt in 0..32 {
            let d = s.backoff(attempt);
            assert!(d >= Duration::from_secs(10));
            assert!(d <= Duration::from_secs(15));
        }
    }
}
