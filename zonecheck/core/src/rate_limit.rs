//! Per-identity fixed-window rate limiting
//!
//! Every caller identity maps to a [`RateLimitPolicy`]. Requests within the
//! same window share one counter:
//!
//! ```text
//! window_start = now - (now mod window_secs)
//! key          = {prefix}:{identity}:{window_start}
//! ```
//!
//! With a shared store configured the counter lives in the store
//! (INCR + EXPIRE in one step) so every instance sees the same count. If the
//! store is unreachable the limiter fails open: the request is allowed and a
//! warning is logged. Without a store the counters are kept in-process and
//! swept periodically.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use zonecheck_core::clock::SystemClock;
//! use zonecheck_core::rate_limit::{RateLimitConfig, RateLimiter};
//! use zonecheck_core::store::SharedStore;
//!
//! # tokio_test::block_on(async {
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::default(),
//!     SharedStore::Disabled,
//!     Arc::new(SystemClock),
//! );
//! let decision = limiter.check_limit("web-app").await;
//! assert!(decision.allowed);
//! assert_eq!(decision.limit, 60);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::{ZoneError, ZoneResult};
use crate::store::SharedStore;
use crate::task::PeriodicTask;

/// Identity used by the web application
pub const WEB_APP_IDENTITY: &str = "web-app";

/// Identity used by the delegated query service
pub const MCP_SERVER_IDENTITY: &str = "mcp-server";

// =============================================================================
// Configuration
// =============================================================================

/// Quota for one caller identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Window length in seconds
    pub window_secs: u64,

    /// Requests allowed per window
    pub max_requests: u32,

    /// Counter key prefix
    pub prefix: String,
}

impl RateLimitPolicy {
    /// Create a policy
    #[must_use]
    pub fn new(window_secs: u64, max_requests: u32, prefix: impl Into<String>) -> Self {
        Self {
            window_secs,
            max_requests,
            prefix: prefix.into(),
        }
    }

    /// 60 requests per minute
    #[must_use]
    pub fn web_app() -> Self {
        Self::new(60, 60, "ratelimit:webapp")
    }

    /// 300 requests per minute
    #[must_use]
    pub fn mcp_server() -> Self {
        Self::new(60, 300, "ratelimit:mcp")
    }

    /// Check the policy is usable
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a zero window, a zero quota or an empty
    /// prefix.
    pub fn validate(&self) -> ZoneResult<()> {
        if self.window_secs == 0 {
            return Err(ZoneError::Configuration(
                "rate limit window must be at least one second".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(ZoneError::Configuration(
                "rate limit max_requests must be positive".to_string(),
            ));
        }
        if self.prefix.trim().is_empty() {
            return Err(ZoneError::Configuration(
                "rate limit prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn window_len(&self) -> i64 {
        i64::try_from(self.window_secs.max(1)).unwrap_or(i64::MAX)
    }
}

/// Rate limiter configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether limits are enforced
    pub enabled: bool,

    /// Identity whose policy applies to unknown callers
    pub default_identity: String,

    /// Policies by identity
    pub policies: HashMap<String, RateLimitPolicy>,

    /// How often in-process windows are swept
    pub sweep_interval: Duration,

    /// How long an expired window is kept before the sweep drops it
    pub sweep_grace: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let policies = HashMap::from([
            (WEB_APP_IDENTITY.to_string(), RateLimitPolicy::web_app()),
            (MCP_SERVER_IDENTITY.to_string(), RateLimitPolicy::mcp_server()),
        ]);
        Self {
            enabled: true,
            default_identity: WEB_APP_IDENTITY.to_string(),
            policies,
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_grace: Duration::from_secs(10 * 60),
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with the built-in policies
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration that allows everything
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Add or replace the policy for `identity`
    #[must_use]
    pub fn with_policy(mut self, identity: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.policies.insert(identity.into(), policy);
        self
    }

    /// Enable or disable enforcement
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Policy for `identity`, falling back to the default identity's
    #[must_use]
    pub fn policy_for(&self, identity: &str) -> Option<&RateLimitPolicy> {
        self.policies
            .get(identity)
            .or_else(|| self.policies.get(&self.default_identity))
    }

    /// Check every policy and the default identity
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first problem found.
    pub fn validate(&self) -> ZoneResult<()> {
        if !self.policies.contains_key(&self.default_identity) {
            return Err(ZoneError::Configuration(format!(
                "default rate limit identity '{}' has no policy",
                self.default_identity
            )));
        }
        for (identity, policy) in &self.policies {
            policy
                .validate()
                .map_err(|e| ZoneError::Configuration(format!("policy '{identity}': {e}")))?;
        }
        Ok(())
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of a rate limit check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Requests left in the current window
    pub remaining: u32,

    /// End of the current window
    pub reset_at: DateTime<Utc>,

    /// Requests allowed per window
    pub limit: u32,
}

impl RateLimitDecision {
    /// Standard `X-RateLimit-*` response header values
    #[must_use]
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ]
    }

    /// Convert a rejection into [`ZoneError::RateLimitExceeded`]
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` when the decision is a rejection.
    pub fn into_result(self) -> ZoneResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ZoneError::RateLimitExceeded {
                limit: self.limit,
                remaining: self.remaining,
                reset_at: self.reset_at,
            })
        }
    }
}

/// Limiter counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    /// Checks performed
    pub checks: u64,
    /// Checks that were rejected
    pub rejected: u64,
    /// Checks allowed because the shared store was unavailable
    pub failed_open: u64,
    /// In-process windows currently tracked
    pub tracked_windows: usize,
}

// =============================================================================
// Limiter
// =============================================================================

#[derive(Clone, Debug)]
struct RateWindow {
    window_end: DateTime<Utc>,
    count: u64,
}

#[derive(Debug, Default)]
struct LimiterCounters {
    checks: AtomicU64,
    rejected: AtomicU64,
    failed_open: AtomicU64,
}

#[derive(Debug)]
struct LimiterInner {
    config: RateLimitConfig,
    store: SharedStore,
    windows: DashMap<String, RateWindow>,
    clock: SharedClock,
    counters: LimiterCounters,
}

/// Fixed-window rate limiter (cheap to clone)
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Create a limiter
    ///
    /// Counters go to `store` when it is enabled, otherwise they stay
    /// in-process.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                config,
                store,
                windows: DashMap::new(),
                clock,
                counters: LimiterCounters::default(),
            }),
        }
    }

    /// Limiter configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Whether counters are kept in the shared store
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.inner.store.is_enabled()
    }

    /// Count one request for `identity` and decide whether it may proceed
    pub async fn check_limit(&self, identity: &str) -> RateLimitDecision {
        let inner = &self.inner;
        let now = inner.clock.now();
        let Some(policy) = inner.config.policy_for(identity) else {
            // Validated configs always have a default policy
            return RateLimitDecision {
                allowed: true,
                remaining: 0,
                reset_at: now,
                limit: 0,
            };
        };

        let window_len = policy.window_len();
        let now_secs = now.timestamp();
        let window_start = now_secs - now_secs.rem_euclid(window_len);
        let reset_at = DateTime::from_timestamp(window_start.saturating_add(window_len), 0)
            .unwrap_or(now);

        if !inner.config.enabled {
            return RateLimitDecision {
                allowed: true,
                remaining: policy.max_requests,
                reset_at,
                limit: policy.max_requests,
            };
        }

        inner.counters.checks.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}:{identity}:{window_start}", policy.prefix);

        let count = if inner.store.is_enabled() {
            let expiry = Duration::from_secs(policy.window_secs.max(1));
            match inner.store.incr_with_expiry(&key, expiry).await {
                Ok(count) => count,
                Err(e) => {
                    inner.counters.failed_open.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        identity,
                        error = %e,
                        "Rate limit store unavailable; allowing request"
                    );
                    return RateLimitDecision {
                        allowed: true,
                        remaining: policy.max_requests.saturating_sub(1),
                        reset_at,
                        limit: policy.max_requests,
                    };
                }
            }
        } else {
            let mut window = inner.windows.entry(key).or_insert_with(|| RateWindow {
                window_end: reset_at,
                count: 0,
            });
            window.count = window.count.saturating_add(1);
            window.count
        };

        let limit = u64::from(policy.max_requests);
        let allowed = count <= limit;
        let remaining = u32::try_from(limit.saturating_sub(count)).unwrap_or(0);

        if !allowed {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                identity,
                count,
                limit = policy.max_requests,
                reset_at = %reset_at,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            remaining,
            reset_at,
            limit: policy.max_requests,
        }
    }

    /// Like [`RateLimiter::check_limit`] but rejects with an error
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` when the quota is used up.
    pub async fn check(&self, identity: &str) -> ZoneResult<RateLimitDecision> {
        self.check_limit(identity).await.into_result()
    }

    /// Drop in-process windows that ended more than the grace period ago,
    /// and expired counter keys held by an in-process shared store
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        let cutoff = self.inner.clock.now() - crate::clock::to_chrono(self.inner.config.sweep_grace);
        let before = self.inner.windows.len();
        self.inner.windows.retain(|_, w| w.window_end >= cutoff);
        let removed = before.saturating_sub(self.inner.windows.len());
        let purged = self.inner.store.purge_expired();
        if removed > 0 || purged > 0 {
            tracing::debug!(removed, purged, "Swept expired rate limit windows");
        }
        removed
    }

    /// Sweep periodically until the returned task is stopped
    #[must_use]
    pub fn start_sweeper(&self) -> PeriodicTask {
        let limiter = self.clone();
        PeriodicTask::spawn(
            "rate-limit-sweep",
            self.inner.config.sweep_interval,
            move || {
                let limiter = limiter.clone();
                async move {
                    limiter.sweep();
                }
            },
        )
    }

    /// Limiter counters
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let counters = &self.inner.counters;
        RateLimiterStats {
            checks: counters.checks.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            failed_open: counters.failed_open.load(Ordering::Relaxed),
            tracked_windows: self.inner.windows.len(),
        }
    }
}
