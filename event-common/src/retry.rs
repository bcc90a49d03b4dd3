//! # Retry
//!
//! Backoff schedule for event batches that could not be persisted at all.
use std::time;

/// Exponential backoff: `initial_interval * backoff_coefficient^(attempt - 1)`,
/// capped by `maximum_interval`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    /// Queue to move retried jobs to. Defaults to the job's own queue.
    pub queue: Option<String>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Delay before the next try, given the attempt that just failed (starting at 1).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }

    pub fn retry_queue<'s>(&'s self, current_queue: &'s str) -> &'s str {
        self.queue.as_deref().unwrap_or(current_queue)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    queue: Option<String>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            queue: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn queue(mut self, queue: Option<&str>) -> RetryPolicyBuilder {
        self.queue = queue.map(str::to_owned);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            queue: self.queue.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_exponentially() {
        let policy = RetryPolicy::build(2, time::Duration::from_secs(1)).provide();
        assert_eq!(policy.retry_interval(1), time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(2), time::Duration::from_secs(2));
        assert_eq!(policy.retry_interval(4), time::Duration::from_secs(8));
    }

    #[test]
    fn caps_at_maximum_interval() {
        let policy = RetryPolicy::build(10, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(30))
            .provide();
        assert_eq!(policy.retry_interval(2), time::Duration::from_secs(10));
        assert_eq!(policy.retry_interval(3), time::Duration::from_secs(30));
        // Overflowing powers saturate instead of panicking.
        assert_eq!(policy.retry_interval(100), time::Duration::from_secs(30));
    }

    #[test]
    fn retries_into_configured_queue() {
        let default = RetryPolicy::default();
        assert_eq!(default.retry_queue("events"), "events");

        let moved = RetryPolicy::build(2, time::Duration::from_secs(1))
            .queue(Some("events-retry"))
            .provide();
        assert_eq!(moved.retry_queue("events"), "events-retry");
    }
}
