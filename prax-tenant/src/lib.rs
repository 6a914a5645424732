//! # prax-tenant
//!
//! Tenant context and tenant-scoped connection pools for the Prax ORM.
//!
//! This crate provides:
//! - A per-task current tenant that never leaks across tasks sharing a thread
//! - Tenant resolution for the schema, database-per-tenant, shard and
//!   custom-config strategies
//! - One connection pool per (owner, tenant, role, shard), reused while its
//!   configuration is unchanged
//! - A global ceiling on physical connections shared by all pools of a base
//!   configuration
//! - A `switch` that always restores the caller's tenant
//!
//! ## Context
//!
//! ```rust
//! use prax_tenant::context::{self, TenantId};
//!
//! context::sync_unit_of_work(|| {
//!     context::sync_scope("acme", || {
//!         assert_eq!(context::current(), Some(TenantId::new("acme")));
//!     });
//!     assert_eq!(context::current(), None);
//! });
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use prax_tenant::{Strategy, TenancyConfig};
//!
//! let config = TenancyConfig::from_toml_str(r#"
//!     strategy = "schema"
//!     persistent_schemas = ["shared"]
//!     database_url = "postgres://app@localhost/app?pool_size=10"
//!
//!     [max_connections]
//!     primary = 40
//! "#).unwrap();
//!
//! assert_eq!(config.strategy, Strategy::Schema);
//! assert_eq!(config.max_connections_for("primary"), Some(40));
//! ```
//!
//! ## Switching
//!
//! ```rust,ignore
//! use prax_tenant::prelude::*;
//!
//! let registry = TenantRegistry::new(config).with_source(load_tenants);
//! let handler = ConnectionHandler::builder(connector, registry).build();
//! let tenant = Tenant::new(handler);
//!
//! tenant
//!     .run(async {
//!         tenant.switch("acme", async {
//!             let conn = tenant.connection().await?;
//!             // queries here see only acme's data
//!             Ok::<_, TenantError>(())
//!         })
//!         .await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod observer;
pub mod pool;
pub mod quote;
pub mod registry;
pub mod strategy;
pub mod tenant;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    DbConfig, DbOverride, PoolOptions, PoolOverride, TenancyConfig, TenancyConfigBuilder,
    DEFAULT_CONFIG_NAME,
};
pub use context::TenantId;
pub use descriptor::{ConnectionDescriptor, ConnectionOwner, NamedOwner, qualified_name};
pub use error::{BoxError, ErrorCode, Selector, TenantError, TenantNotFound, TenantResult};
pub use handler::{ConnectionHandler, ConnectionHandlerBuilder};
pub use manager::{Establishment, PoolConfig, PoolKey, PoolManager, Role, Shard};
pub use observer::{Observers, PoolEstablished, SwitchEvent, TenantObserver};
pub use pool::{
    ConnectionLimiter, ConnectionLimits, ConnectionPool, Connector, PoolStats, PoolStatus,
    PooledConnection,
};
pub use quote::{Dialect, quote_identifier, split_search_path};
pub use registry::{StaticTenants, TenantConfig, TenantRegistry, TenantSource, TenantSpec};
pub use strategy::{EnvironmentTransform, Strategy, TransformKind};
pub use tenant::Tenant;

// Re-export for connector implementations
pub use async_trait::async_trait;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{DbConfig, DbOverride, TenancyConfig};
    pub use crate::context::{self, TenantId};
    pub use crate::error::{TenantError, TenantResult};
    pub use crate::handler::ConnectionHandler;
    pub use crate::manager::{Role, Shard};
    pub use crate::observer::TenantObserver;
    pub use crate::pool::{Connector, PooledConnection};
    pub use crate::registry::{TenantRegistry, TenantSpec};
    pub use crate::strategy::Strategy;
    pub use crate::tenant::Tenant;
}
