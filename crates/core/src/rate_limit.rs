use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(2000);

/// Gates outgoing human messages by a minimum spacing between accepted sends.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: None,
        }
    }

    /// Accepts `now` when at least `min_interval` has passed since the last
    /// accepted call. Rejected calls do not move the window.
    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    min_interval_ms = self.min_interval.as_millis() as u64,
                    "Message rate limited"
                );
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }

    /// Time left before the next send would be accepted.
    pub fn retry_in(&self, now: Instant) -> Duration {
        self.last_accepted
            .map(|last| self.min_interval.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}
