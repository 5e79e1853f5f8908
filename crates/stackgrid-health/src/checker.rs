//! Probe result debouncing.
//!
//! A [`HealthTracker`] turns a stream of raw probe results for one node into
//! a debounced [`HealthLevel`] with exponential backoff between checks.

use std::time::Duration;

use stackgrid_core::config::{HealthSettings, parse_duration};
use stackgrid_core::{HealthCheckConfig, HealthLevel, HealthStatus};
use tracing::{debug, warn};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn status(&self) -> HealthStatus {
        match self {
            ProbeResult::Healthy => HealthStatus::Healthy,
            ProbeResult::Unhealthy | ProbeResult::Failed => HealthStatus::Unhealthy,
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks consecutive probe results for a single node.
///
/// `None` means no probe has settled a level yet. Failures below the
/// threshold keep the current level. The first success after `unhealthy`
/// yields `degraded`; `recovery_threshold` consecutive successes yield
/// `healthy`. A failure while degraded drops straight back to `unhealthy`.
#[derive(Debug)]
pub struct HealthTracker {
    level: Option<HealthLevel>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    recovery_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
}

impl HealthTracker {
    /// Thresholds from the node's check config, recovery from the monitor settings.
    pub fn new(config: &HealthCheckConfig, settings: &HealthSettings) -> Self {
        let interval = parse_duration(&config.interval)
            .or_else(|| parse_duration(&settings.interval))
            .unwrap_or(DEFAULT_INTERVAL);
        Self::with_thresholds(config.retries, settings.recovery_threshold, interval)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, recovery_threshold: u32, interval: Duration) -> Self {
        Self {
            level: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
        }
    }

    /// Record a probe result and return the new level.
    pub fn record(&mut self, result: ProbeResult) -> Option<HealthLevel> {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                let recovered = self.consecutive_successes >= self.recovery_threshold;
                let next = match self.level {
                    None | Some(HealthLevel::Healthy) => HealthLevel::Healthy,
                    Some(HealthLevel::Unhealthy | HealthLevel::Degraded) if recovered => HealthLevel::Healthy,
                    Some(HealthLevel::Unhealthy | HealthLevel::Degraded) => HealthLevel::Degraded,
                };
                if self.level != Some(next) {
                    debug!(successes = self.consecutive_successes, level = ?next, "health recovering");
                }
                self.level = Some(next);
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);

                let tripped = self.consecutive_failures >= self.unhealthy_threshold
                    || self.level == Some(HealthLevel::Degraded);
                if tripped {
                    if self.level != Some(HealthLevel::Unhealthy) {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "service marked unhealthy"
                        );
                    }
                    self.level = Some(HealthLevel::Unhealthy);
                }
            }
        }
        self.level
    }

    pub fn level(&self) -> Option<HealthLevel> {
        self.level
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Wait before the next check.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}
