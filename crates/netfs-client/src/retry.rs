//! Exponential back-off for the server-info fetch.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetryConfig;

/// Wait schedule for a sequence of attempts within a fixed total budget.
///
/// Each `next_wait` doubles the previous wait up to `max_wait` and never
/// reaches past the budget. Time is tokio time, so paused-clock tests see
/// the schedule without sleeping.
#[derive(Debug)]
pub struct ExponentialBackoff {
    max_wait: Duration,
    total_budget: Duration,
    current_wait: Duration,
    start: Instant,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(init_wait: Duration, max_wait: Duration, total_budget: Duration) -> Self {
        Self {
            max_wait,
            total_budget,
            current_wait: init_wait,
            start: Instant::now(),
            attempts: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.retry_init_wait,
            config.retry_max_wait,
            config.retry_total_time,
        )
    }

    /// The wait before the next attempt, or `None` once the budget is spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        let elapsed = self.start.elapsed();
        if elapsed >= self.total_budget {
            return None;
        }
        let wait = self.current_wait;
        self.current_wait = (self.current_wait * 2).min(self.max_wait);
        self.attempts += 1;
        Some(wait.min(self.total_budget - elapsed))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
