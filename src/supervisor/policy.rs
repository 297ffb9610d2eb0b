//! Restart policy for crashed extensions.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Crashes tolerated inside `window`; one more disables the extension
    pub max_retries: u32,
    pub window: Duration,
    pub stable_uptime: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            max_retries: config.max_retries,
            window: Duration::from_secs(config.retry_window_secs),
            stable_uptime: Duration::from_secs(config.stable_uptime_secs),
        }
    }

    /// Delay before restart `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartVerdict {
    Restart { attempt: u32, delay: Duration },
    Disable { crashes: u32 },
}

/// Recent crash times of one extension.
#[derive(Debug, Default)]
pub struct CrashHistory {
    crashes: VecDeque<Instant>,
}

impl CrashHistory {
    /// Record a crash at `now` after the process ran for `uptime`.
    pub fn record(&mut self, policy: &RestartPolicy, now: Instant, uptime: Duration) -> RestartVerdict {
        if uptime >= policy.stable_uptime {
            self.crashes.clear();
        }

        while let Some(&oldest) = self.crashes.front() {
            if now.duration_since(oldest) > policy.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }

        self.crashes.push_back(now);
        let count = self.crashes.len() as u32;

        if count > policy.max_retries {
            RestartVerdict::Disable { crashes: count }
        } else {
            RestartVerdict::Restart {
                attempt: count,
                delay: policy.delay_for(count),
            }
        }
    }
}
