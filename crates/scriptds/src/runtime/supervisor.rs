//! Environment supervisor with restart budget and exponential backoff

use std::time::{Duration, Instant};

use crate::config::RestartSettings;

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Maximum number of restarts before giving up
    pub max_restarts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Time window for counting restarts (resets after stable period)
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartSettings::default().into()
    }
}

impl From<RestartSettings> for RestartPolicy {
    fn from(settings: RestartSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            restart_window: Duration::from_millis(settings.restart_window_ms),
        }
    }
}

/// Tracks how often an instance's environment had to be re-created.
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    restart_count: u32,
    current_backoff: Duration,
    last_stable_time: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial_backoff = policy.initial_backoff;
        Self {
            policy,
            restart_count: 0,
            current_backoff: initial_backoff,
            last_stable_time: None,
        }
    }

    /// Called when an environment starts successfully
    pub fn on_start(&mut self) {
        self.last_stable_time = Some(Instant::now());
    }

    /// Called when an environment is found dead. Returns the delay before
    /// re-creating it, or None if the restart budget is spent.
    pub fn on_crash(&mut self) -> Option<Duration> {
        // A long stable run earns a fresh budget
        if let Some(stable_time) = self.last_stable_time {
            if stable_time.elapsed() >= self.policy.restart_window {
                self.reset();
            }
        }

        self.restart_count += 1;
        if self.restart_count > self.policy.max_restarts {
            return None;
        }

        let delay = self.current_backoff;
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.current_backoff = self.policy.initial_backoff;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}
