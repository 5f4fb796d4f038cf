//! Reconnect schedule for the desktop-app connection

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Port used when the configured list is empty
const FALLBACK_PORT: u16 = 18642;
/// Slow attempts between "still waiting" log lines (about once a minute at 10 s)
const SLOW_LOG_EVERY: u32 = 6;

/// Attempt counter, port rotation and backoff delay
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    ports: Vec<u16>,
    base_delay: Duration,
    factor: f64,
    max_delay: Duration,
    fast_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            ports: config.ports.clone(),
            base_delay: config.base_delay(),
            factor: config.backoff_factor,
            max_delay: config.max_delay(),
            fast_attempts: config.fast_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Port for the next connect: `ports[attempts % len]`
    pub fn port(&self) -> u16 {
        if self.ports.is_empty() {
            return FALLBACK_PORT;
        }
        self.ports[self.attempts as usize % self.ports.len()]
    }

    /// Delay before attempt `n` (1-based)
    pub fn delay_for(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        if n > self.fast_attempts {
            return self.max_delay;
        }
        let ms = self.base_delay.as_millis() as f64 * self.factor.powi(n as i32 - 1);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }

    /// Count a failed attempt and return the delay before the next one
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        self.delay_for(self.attempts)
    }

    /// Connected: start over
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether the current attempt is worth an info-level line
    pub fn should_log(&self) -> bool {
        self.attempts <= self.fast_attempts || (self.attempts - self.fast_attempts) % SLOW_LOG_EVERY == 0
    }
}
