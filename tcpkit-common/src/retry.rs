//! # Retry Policy
//!
//! A small attempt budget shared by send and receive loops.

use std::time::Duration;

/// Interval used when a policy with remaining attempts has a zero interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Remaining attempts plus the pause between them.
///
/// `count` is decremented only after a failed attempt, so a policy with
/// `count = N` allows N+1 attempts in total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retry {
    /// Attempts left after the first one.
    pub count: u32,
    /// Pause between attempts; zero selects [`DEFAULT_RETRY_INTERVAL`].
    pub interval: Duration,
}

impl Retry {
    /// Creates a policy with an explicit attempt count and interval.
    pub const fn new(count: u32, interval: Duration) -> Self {
        Retry { count, interval }
    }

    /// Returns true while attempts remain.
    pub fn has_remaining(&self) -> bool {
        self.count > 0
    }

    /// Consumes one attempt and returns how long to wait before it.
    ///
    /// Returns `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        if self.interval.is_zero() {
            self.interval = DEFAULT_RETRY_INTERVAL;
        }
        Some(self.interval)
    }

    /// Sleeps for the next interval if an attempt remains.
    ///
    /// Returns false when the caller should give up.
    pub(crate) async fn backoff(retry: &mut Option<Retry>) -> bool {
        let delay = match retry.as_mut().and_then(Retry::next_delay) {
            Some(delay) => delay,
            None => return false,
        };
        tokio::time::sleep(delay).await;
        true
    }
}
