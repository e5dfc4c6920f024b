//! Poll scheduling for submitted commands.

use std::time::Duration;

/// Exponential backoff settings for polling a submitted command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second poll.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Multiplier applied after each poll.
    pub factor: u32,
    /// Consecutive failed polls tolerated before giving up.
    pub max_poll_failures: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
            factor: 2,
            max_poll_failures: 3,
        }
    }
}

/// Sequence of poll delays produced by a [`PollPolicy`].
#[derive(Clone, Debug)]
pub(super) struct Backoff {
    next: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    pub(super) const fn new(policy: &PollPolicy) -> Self {
        Self {
            next: policy.initial,
            max: policy.max,
            factor: policy.factor,
        }
    }

    /// Returns the current delay and advances the sequence.
    pub(super) fn next_delay(&mut self) -> Duration {
        let current = self.next.min(self.max);
        self.next = current.saturating_mul(self.factor.max(1)).min(self.max);
        current
    }
}
