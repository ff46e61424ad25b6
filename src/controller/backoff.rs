//! # Exponential Backoff
//!
//! Bounded exponential backoff used to space out retries of one resource.
//!
//! Each delay doubles the previous one until the cap is reached; a success resets
//! the sequence.
//!
//! ## Usage
//!
//! ```rust
//! use service_instance_operator::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay, also the value after a reset
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound of every delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` and never exceeding `max`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            current: initial,
            max,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Restart the sequence from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
