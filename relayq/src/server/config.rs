//! Runner configuration
//!
//! Timings of the worker and retry loops.

use crate::config::Settings;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Pause after each `run` attempt before the worker releases its slot
    pub run_pause: Duration,

    /// Pause between two retry scans of the same command
    pub retry_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            run_pause: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl RunnerConfig {
    /// Set the pause after each run attempt
    #[must_use]
    pub fn run_pause(mut self, pause: Duration) -> Self {
        self.run_pause = pause;
        self
    }

    /// Set the pause between retry scans
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

impl From<&Settings> for RunnerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            run_pause: settings.run_pause(),
            retry_interval: settings.retry_scan(),
        }
    }
}
