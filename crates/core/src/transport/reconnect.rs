//! Reconnection scheduling with exponential backoff
//!
//! The scheduler owns the single pending reconnect timer. Each scheduled retry
//! uses the current delay and then doubles it (capped at `max_backoff`); a
//! successful connect resets it to `initial_backoff`.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry after a failure
    pub initial_backoff: Duration,
    /// Ceiling for the delay between attempts
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl ReconnectConfig {
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
}

/// Exponential backoff state
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
        }
    }

    /// Delay the next scheduled retry will use
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the current delay and advance to the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        // Exponential backoff: double the delay, capped at max_backoff
        self.current = std::cmp::min(self.current.saturating_mul(2), self.config.max_backoff);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff;
    }
}

/// Backoff plus the one pending reconnect timer
pub struct ReconnectScheduler {
    backoff: Backoff,
    timer: Option<Pin<Box<Sleep>>>,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            backoff: Backoff::new(config),
            timer: None,
        }
    }

    /// Arm the reconnect timer
    ///
    /// Returns the chosen delay, or `None` when a timer is already pending
    /// (the request is dropped and the backoff does not advance).
    pub fn schedule(&mut self) -> Option<Duration> {
        if self.timer.is_some() {
            return None;
        }
        let delay = self.backoff.next_delay();
        self.timer = Some(Box::pin(sleep(delay)));
        Some(delay)
    }

    /// Drop the pending timer, if any
    pub fn cancel(&mut self) {
        self.timer = None;
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_some()
    }

    /// Called on a successful connect
    pub fn reset(&mut self) {
        self.backoff.reset();
    }

    pub fn current_delay(&self) -> Duration {
        self.backoff.current()
    }

    /// Resolves when the pending timer fires; never resolves if none is armed
    ///
    /// Cancel safe: dropping the future leaves the timer armed.
    pub async fn due(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.as_mut().await;
                self.timer = None;
            }
            None => pending::<()>().await,
        }
    }
}
