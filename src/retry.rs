use std::time::Duration;

use log::{error, warn};

use crate::errors::ReservationError;

/// Bounded retry for units of work that fail with a retryable store error.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. Blocks the calling thread between attempts, so
    /// call it from a blocking context.
    pub fn run<T, F>(&self, label: &str, mut operation: F) -> Result<T, ReservationError>
    where
        F: FnMut() -> Result<T, ReservationError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match operation() {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!("{} failed (attempt {}/{}), retrying: {}", label, attempt, max_attempts, e);
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    error!("{} failed after {} attempts, giving up: {}", label, max_attempts, e);
                    return Err(e);
                }
                result => return result,
            }
        }
    }
}
