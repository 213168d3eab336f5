//! # Fibonacci Backoff
//!
//! Progressive retry backoff for failed reconciliations. Grows more slowly
//! than doubling but still reaches the ceiling in a handful of failures,
//! which suits control loops waiting on external infrastructure to come up.
//! With the reconciler's defaults the sequence is 30s, 30s, 60s, 90s, 150s,
//! 240s, 300s (max). Reset on success.

use std::time::Duration;

/// Fibonacci backoff calculator. Each delay is the sum of the previous two,
/// capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Return the current delay in seconds and advance the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Return the current delay as a [`Duration`] and advance the sequence.
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Restart the sequence after a successful reconciliation.
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(30, 300);

        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 60);
        assert_eq!(backoff.next_backoff_seconds(), 90);
        assert_eq!(backoff.next_backoff_seconds(), 150);
        assert_eq!(backoff.next_backoff_seconds(), 240);
        assert_eq!(backoff.next_backoff_seconds(), 300);
    }

    #[test]
    fn test_ceiling_holds() {
        let mut backoff = FibonacciBackoff::new(30, 300);
        for _ in 0..10 {
            backoff.next_backoff_seconds();
        }
        assert_eq!(backoff.next_backoff_seconds(), 300);
        assert_eq!(backoff.next_backoff_seconds(), 300);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new(30, 300);
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();

        backoff.reset();
        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 60);
    }

    #[test]
    fn test_duration_conversion() {
        let mut backoff = FibonacciBackoff::new(30, 300);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
    }
}
