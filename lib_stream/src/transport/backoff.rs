//! Exponential reconnect backoff: `delay = min(base * 2^attempt, cap)`.

use std::time::Duration;

/// Attempt counter plus delay policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Policy starting at `base`, never exceeding `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    /// Number of reconnects scheduled since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for a given attempt number. Saturates at `cap`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Counts one more scheduled reconnect and returns its delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    /// Back to attempt zero, after a successful open or an explicit disconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
