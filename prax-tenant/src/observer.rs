//! Typed extension points for switch and pool lifecycle events.
//!
//! ```rust,ignore
//! struct Audit;
//!
//! impl TenantObserver for Audit {
//!     fn on_after_switch(&self, event: &SwitchEvent) {
//!         metrics::counter!("tenant_switches", "to" => event.to.to_string()).increment(1);
//!     }
//! }
//!
//! let handler = ConnectionHandler::builder(connector, registry)
//!     .observer(Audit)
//!     .build();
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::DbConfig;
use crate::context::TenantId;
use crate::error::TenantError;
use crate::manager::{Role, Shard};

/// Emitted when a pool is created or replaced.
#[derive(Debug, Clone)]
pub struct PoolEstablished {
    /// Qualified connection name, e.g. `primary[acme]`.
    pub connection_name: String,
    /// Role.
    pub role: Role,
    /// Shard.
    pub shard: Shard,
    /// Tenant.
    pub tenant: TenantId,
    /// Resolved configuration.
    pub config: DbConfig,
    /// Whether an existing pool with a different configuration was replaced.
    pub replaced: bool,
}

/// A tenant switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    /// Tenant active before the switch.
    pub from: TenantId,
    /// Tenant switched to.
    pub to: TenantId,
}

/// Receives tenancy events. Every method defaults to a no-op.
pub trait TenantObserver: Send + Sync {
    /// Before the context changes.
    fn on_before_switch(&self, _event: &SwitchEvent) {}

    /// After the switch body finished and the context was restored.
    fn on_after_switch(&self, _event: &SwitchEvent) {}

    /// A pool was created or replaced.
    fn on_pool_established(&self, _event: &PoolEstablished) {}

    /// Restoring `previous` failed and the default tenant was used instead.
    fn on_restore_fallback(&self, _previous: &TenantId, _error: &TenantError) {}
}

/// Registered observers.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn TenantObserver>>);

impl Observers {
    /// Register an observer.
    pub fn push(&mut self, observer: Arc<dyn TenantObserver>) {
        self.0.push(observer);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no observers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn before_switch(&self, event: &SwitchEvent) {
        self.0.iter().for_each(|o| o.on_before_switch(event));
    }

    pub(crate) fn after_switch(&self, event: &SwitchEvent) {
        self.0.iter().for_each(|o| o.on_after_switch(event));
    }

    pub(crate) fn pool_established(&self, event: &PoolEstablished) {
        self.0.iter().for_each(|o| o.on_pool_established(event));
    }

    pub(crate) fn restore_fallback(&self, previous: &TenantId, error: &TenantError) {
        self.0.iter().for_each(|o| o.on_restore_fallback(previous, error));
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.0.len()).finish()
    }
}

/// Records every event, for tests.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    /// Switches, in order.
    pub switches: parking_lot::Mutex<Vec<SwitchEvent>>,
    /// Pool establishments, in order.
    pub established: parking_lot::Mutex<Vec<PoolEstablished>>,
    /// Restore fallbacks, in order.
    pub fallbacks: parking_lot::Mutex<Vec<TenantId>>,
}

#[cfg(any(test, feature = "testing"))]
impl TenantObserver for RecordingObserver {
    fn on_after_switch(&self, event: &SwitchEvent) {
        self.switches.lock().push(event.clone());
    }

    fn on_pool_established(&self, event: &PoolEstablished) {
        self.established.lock().push(event.clone());
    }

    fn on_restore_fallback(&self, previous: &TenantId, _error: &TenantError) {
        self.fallbacks.lock().push(previous.clone());
    }
}
