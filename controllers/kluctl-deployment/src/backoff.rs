//! # Fibonacci Backoff
//!
//! Backoff for reconcile errors that escape the cycle itself (status patch
//! failures, result store outages). It grows more slowly than exponential
//! backoff, so a flapping API server is retried often enough without being
//! hammered.
//!
//! Sequence with the controller defaults: 5s, 5s, 10s, 15s, 25s, 40s, ... capped
//! at the maximum. The reconciler additionally caps it at the resource's
//! retry interval.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, starting with the minimum
/// twice and never exceeding the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff in seconds
    prev_seconds: u64,
    /// Current backoff in seconds
    current_seconds: u64,
    /// Maximum backoff in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given bounds in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - First (and second) backoff value
    /// * `max_seconds` - Cap of the sequence
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Get the next backoff as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}
