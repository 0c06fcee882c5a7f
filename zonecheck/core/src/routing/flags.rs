//! Runtime feature flags
//!
//! One flag today: whether the remote query service is the preferred
//! backend. Flags can be flipped at runtime by an operator; the change takes
//! effect on the next backend selection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// Name of the remote-service flag
pub const USE_REMOTE_SERVICE: &str = "USE_MCP_SERVICE";

/// A single flag with audit fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Flag name
    pub name: String,
    /// Current value
    pub enabled: bool,
    /// What the flag controls
    pub description: String,
    /// When the value last changed
    pub last_updated: DateTime<Utc>,
    /// Who changed it
    pub updated_by: String,
}

/// Flag set shared by the router and the admin surface
#[derive(Debug)]
pub struct FeatureFlags {
    use_remote_service: RwLock<FeatureFlag>,
    clock: SharedClock,
}

impl FeatureFlags {
    /// Create the flag set
    #[must_use]
    pub fn new(use_remote_service: bool, clock: SharedClock) -> Arc<Self> {
        let flag = FeatureFlag {
            name: USE_REMOTE_SERVICE.to_string(),
            enabled: use_remote_service,
            description: "Route zone lookups to the remote query service".to_string(),
            last_updated: clock.now(),
            updated_by: "system".to_string(),
        };
        Arc::new(Self {
            use_remote_service: RwLock::new(flag),
            clock,
        })
    }

    /// Whether the remote service is preferred
    #[must_use]
    pub fn use_remote_service(&self) -> bool {
        self.use_remote_service.read().enabled
    }

    /// Current value of the remote-service flag
    #[must_use]
    pub fn remote_service_flag(&self) -> FeatureFlag {
        self.use_remote_service.read().clone()
    }

    /// Change the remote-service flag
    pub fn set_use_remote_service(&self, enabled: bool, updated_by: &str) -> FeatureFlag {
        let mut flag = self.use_remote_service.write();
        let previous = flag.enabled;
        flag.enabled = enabled;
        flag.last_updated = self.clock.now();
        flag.updated_by = updated_by.to_string();
        tracing::info!(
            flag = %flag.name,
            previous,
            enabled,
            updated_by,
            "Feature flag updated"
        );
        flag.clone()
    }

    /// All flags
    #[must_use]
    pub fn all(&self) -> Vec<FeatureFlag> {
        vec![self.remote_service_flag()]
    }
}
