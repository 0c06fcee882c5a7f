//! Backend routing with health-based failover
//!
//! ```text
//! +-----------------------+
//! | ResilientQueryService |  <-- selection, attempts, fallback
//! +-----------+-----------+
//!             |
//!      +------+------+
//!      |             |
//!      v             v
//! +---------+   +----------+
//! | Primary |   | Secondary|
//! |  Local  |   |  Remote  |
//! +---------+   +----------+
//! ```
//!
//! Health is tracked per slot ([`health`]); the preferred slot comes from
//! the runtime [`flags`].

pub mod backend;
pub mod flags;
pub mod health;
pub mod service;

pub use backend::{
    Backend, BackendSlot, Geocoder, LocalBackend, PointCheck, RemoteBackend, ZoneBackend,
    REMOTE_TIMEOUT,
};
pub use flags::{FeatureFlag, FeatureFlags, USE_REMOTE_SERVICE};
pub use health::{BackendState, HealthConfig, HealthMetrics};
pub use service::{ResilientQueryService, ServiceMetrics, SlotMetrics};
