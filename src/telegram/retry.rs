//! Retry pacing for upstream calls
//!
//! Telegram answers bursts with flood waits and the occasional dropped
//! request. Callers retry transient failures with exponential backoff.

use std::time::Duration;

/// Longest single wait between attempts
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff helper
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay: Duration::from_millis(base_delay_ms),
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Wait before the next retry, or None once every retry is used
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base_delay * 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;

        Some(delay.min(MAX_DELAY))
    }
}
