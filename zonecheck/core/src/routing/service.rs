//! Resilient query routing across the two backend slots
//!
//! ```text
//!            select()
//!   preferred (flag) ──cooling down?──yes──> alternate
//!        │no                                  │
//!        v                                    v
//!   attempt ──ok──> record success, return
//!        │err
//!        v
//!   record failure
//!   preferred failed, attempts left? ──> alternate now, no delay
//!   otherwise ──> sleep(delay × attempt), select() again
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::backend::{Backend, BackendSlot, PointCheck, ZoneBackend};
use super::flags::FeatureFlags;
use super::health::{BackendState, HealthConfig, HealthMetrics};
use crate::clock::SharedClock;
use crate::error::{ErrorKind, ZoneError, ZoneResult};
use crate::spatial::Coordinates;

// =============================================================================
// Metrics
// =============================================================================

/// Health view of one slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetrics {
    /// Backend name
    pub backend: String,
    /// Derived state
    pub state: BackendState,
    /// Raw counters
    #[serde(flatten)]
    pub health: HealthMetrics,
}

/// Router health view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Primary slot
    pub primary: SlotMetrics,
    /// Secondary slot, when configured
    pub secondary: Option<SlotMetrics>,
    /// Slot that served the most recent successful operation
    pub active: Option<BackendSlot>,
    /// Slot preferred by the feature flags
    pub preferred: BackendSlot,
}

// =============================================================================
// Router
// =============================================================================

struct SlotEntry<B> {
    backend: B,
    health: RwLock<HealthMetrics>,
}

impl<B> SlotEntry<B> {
    fn new(backend: B) -> Self {
        Self {
            backend,
            health: RwLock::new(HealthMetrics::default()),
        }
    }
}

#[derive(Clone, Copy)]
enum Operation<'r> {
    CheckPoint(Coordinates),
    Geocode(&'r str),
}

impl Operation<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::CheckPoint(_) => "check_point",
            Self::Geocode(_) => "geocode",
        }
    }
}

enum Outcome {
    Point(PointCheck),
    Location(Coordinates),
}

/// Query router with per-slot health, cooldown and fallback
pub struct ResilientQueryService<B = Backend> {
    primary: SlotEntry<B>,
    secondary: Option<SlotEntry<B>>,
    flags: Arc<FeatureFlags>,
    config: HealthConfig,
    clock: SharedClock,
    active: RwLock<Option<BackendSlot>>,
}

impl<B: ZoneBackend> ResilientQueryService<B> {
    /// Create a router over `primary` and an optional `secondary`
    #[must_use]
    pub fn new(
        primary: B,
        secondary: Option<B>,
        flags: Arc<FeatureFlags>,
        config: HealthConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            primary: SlotEntry::new(primary),
            secondary: secondary.map(SlotEntry::new),
            flags,
            config,
            clock,
            active: RwLock::new(None),
        }
    }

    /// Backend in `slot`, if configured
    #[must_use]
    pub fn backend(&self, slot: BackendSlot) -> Option<&B> {
        self.entry(slot).map(|e| &e.backend)
    }

    /// Feature flags consulted by selection
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    /// Failover tuning
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Slot preferred by the feature flags
    #[must_use]
    pub fn preferred_slot(&self) -> BackendSlot {
        if self.flags.use_remote_service() && self.secondary.is_some() {
            BackendSlot::Secondary
        } else {
            BackendSlot::Primary
        }
    }

    /// State of `slot` now
    #[must_use]
    pub fn state(&self, slot: BackendSlot) -> Option<BackendState> {
        let now = self.clock.now();
        self.entry(slot)
            .map(|e| e.health.read().state(&self.config, now))
    }

    /// Slot the next operation should start on
    ///
    /// The preferred slot unless it is cooling down and the alternate is not.
    #[must_use]
    pub fn select_slot(&self) -> BackendSlot {
        let preferred = self.preferred_slot();
        if self.state(preferred) != Some(BackendState::CoolingDown) {
            return preferred;
        }
        let alternate = preferred.alternate();
        match self.state(alternate) {
            Some(state) if state != BackendState::CoolingDown => {
                tracing::warn!(
                    preferred = %preferred,
                    fallback = %alternate,
                    "Preferred backend cooling down; using alternate"
                );
                alternate
            }
            _ => preferred,
        }
    }

    /// Preload every configured backend
    ///
    /// Failures are logged and recorded as health, never returned. Returns
    /// the slots that are ready.
    pub async fn initialize(&self) -> Vec<BackendSlot> {
        let mut ready = Vec::new();
        for slot in [BackendSlot::Primary, BackendSlot::Secondary] {
            let Some(entry) = self.entry(slot) else {
                continue;
            };
            match entry.backend.preload().await {
                Ok(()) => {
                    self.record_success(slot);
                    ready.push(slot);
                }
                Err(e) => {
                    self.record_failure(slot);
                    tracing::warn!(
                        slot = %slot,
                        backend = entry.backend.name(),
                        error = %e,
                        "Backend preload failed"
                    );
                }
            }
        }
        ready
    }

    /// Check a point through the healthiest backend
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once every attempt has failed.
    pub async fn check_point(&self, coords: Coordinates) -> ZoneResult<PointCheck> {
        match self.execute(Operation::CheckPoint(coords)).await? {
            Outcome::Point(check) => Ok(check),
            Outcome::Location(_) => Err(ZoneError::backend("router", "unexpected geocode result")),
        }
    }

    /// Geocode an address through the healthiest backend
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once every attempt has failed.
    pub async fn geocode(&self, address: &str) -> ZoneResult<Coordinates> {
        match self.execute(Operation::Geocode(address)).await? {
            Outcome::Location(coords) => Ok(coords),
            Outcome::Point(_) => Err(ZoneError::backend("router", "unexpected point result")),
        }
    }

    /// Health of both slots
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        let now = self.clock.now();
        let report = |entry: &SlotEntry<B>| {
            let health = entry.health.read().clone();
            SlotMetrics {
                backend: entry.backend.name().to_string(),
                state: health.state(&self.config, now),
                health,
            }
        };
        ServiceMetrics {
            primary: report(&self.primary),
            secondary: self.secondary.as_ref().map(report),
            active: *self.active.read(),
            preferred: self.preferred_slot(),
        }
    }

    fn entry(&self, slot: BackendSlot) -> Option<&SlotEntry<B>> {
        match slot {
            BackendSlot::Primary => Some(&self.primary),
            BackendSlot::Secondary => self.secondary.as_ref(),
        }
    }

    fn record_success(&self, slot: BackendSlot) {
        if let Some(entry) = self.entry(slot) {
            entry.health.write().record_success(self.clock.now());
        }
    }

    fn record_failure(&self, slot: BackendSlot) {
        if let Some(entry) = self.entry(slot) {
            entry.health.write().record_failure(self.clock.now());
        }
    }

    async fn dispatch(backend: &B, operation: Operation<'_>) -> ZoneResult<Outcome> {
        match operation {
            Operation::CheckPoint(coords) => backend.check_point(coords).await.map(Outcome::Point),
            Operation::Geocode(address) => backend.geocode(address).await.map(Outcome::Location),
        }
    }

    async fn execute(&self, operation: Operation<'_>) -> ZoneResult<Outcome> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut slot = self.select_slot();
        let mut attempts = 0;

        loop {
            let (slot_used, entry) = match self.entry(slot) {
                Some(entry) => (slot, entry),
                None => (BackendSlot::Primary, &self.primary),
            };

            let error = match Self::dispatch(&entry.backend, operation).await {
                Ok(outcome) => {
                    self.record_success(slot_used);
                    *self.active.write() = Some(slot_used);
                    return Ok(outcome);
                }
                // The request itself is bad; no backend will do better
                Err(e) if e.kind() == ErrorKind::Validation => return Err(e),
                Err(e) => e,
            };

            self.record_failure(slot_used);
            attempts += 1;
            tracing::warn!(
                operation = operation.label(),
                slot = %slot_used,
                backend = entry.backend.name(),
                attempt = attempts,
                max_attempts,
                error = %error,
                "Backend operation failed"
            );

            if attempts >= max_attempts {
                tracing::error!(
                    operation = operation.label(),
                    attempts,
                    "Backend operation failed on every attempt"
                );
                return Err(match error {
                    ZoneError::BackendUnavailable { .. } => error,
                    other => ZoneError::backend(entry.backend.name(), other),
                });
            }

            let alternate = slot_used.alternate();
            if slot_used == self.preferred_slot() && self.entry(alternate).is_some() {
                tracing::warn!(
                    operation = operation.label(),
                    from = %slot_used,
                    to = %alternate,
                    "Falling back to alternate backend"
                );
                slot = alternate;
                continue;
            }

            tokio::time::sleep(self.config.delay_after(attempts)).await;
            slot = self.select_slot();
        }
    }
}

impl<B: ZoneBackend> std::fmt::Debug for ResilientQueryService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientQueryService")
            .field("primary", &self.primary.backend.name())
            .field(
                "secondary",
                &self.secondary.as_ref().map(|e| e.backend.name()),
            )
            .field("preferred", &self.preferred_slot())
            .finish_non_exhaustive()
    }
}
