//! Backend health tracking
//!
//! Health is tracked per backend slot, not per request. The state is derived
//! from the counters and the current time, so a backend leaves cooldown on its
//! own once the cooldown period has elapsed.
//!
//! ```text
//!              failure (n < threshold)
//!   Healthy ─────────────────────────> Degraded
//!      ^                                  │ failure (n >= threshold)
//!      │ success / cooldown elapsed       v
//!      └──────────────────────────── CoolingDown
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;

/// Consecutive failures before a backend is avoided
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long an unhealthy backend is avoided
pub const COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Attempts per operation across both backends
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts, multiplied by the attempt number
pub const ATTEMPT_DELAY: Duration = Duration::from_millis(1000);

// =============================================================================
// Configuration
// =============================================================================

/// Failover tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before cooldown
    pub failure_threshold: u32,

    /// Cooldown length
    pub cooldown: Duration,

    /// Attempts per operation
    pub max_attempts: u32,

    /// Base delay between attempts
    pub attempt_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            cooldown: COOLDOWN,
            max_attempts: MAX_ATTEMPTS,
            attempt_delay: ATTEMPT_DELAY,
        }
    }
}

impl HealthConfig {
    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the cooldown length
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base attempt delay
    #[must_use]
    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    /// Delay before attempt `attempt + 1`, after `attempt` failures
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.attempt_delay.saturating_mul(attempt)
    }
}

// =============================================================================
// State
// =============================================================================

/// Derived backend state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// No recent failures
    Healthy,
    /// Failing, but below the threshold
    Degraded,
    /// Over the threshold and inside the cooldown; avoided by selection
    CoolingDown,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::CoolingDown => write!(f, "cooling_down"),
        }
    }
}

/// Health counters for one backend slot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Failures since start
    pub total_failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Most recent failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent success
    pub last_success_at: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    /// Record a success
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
    }

    /// Record a failure
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    /// State at `now`
    #[must_use]
    pub fn state(&self, config: &HealthConfig, now: DateTime<Utc>) -> BackendState {
        if self.consecutive_failures == 0 {
            return BackendState::Healthy;
        }
        if self.consecutive_failures < config.failure_threshold {
            return BackendState::Degraded;
        }
        let in_cooldown = self
            .last_failure_at
            .is_some_and(|at| now - at < to_chrono(config.cooldown));
        if in_cooldown {
            BackendState::CoolingDown
        } else {
            BackendState::Healthy
        }
    }
}
