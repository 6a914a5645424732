//! # Prax Tenancy
//!
//! Multi-tenant connection routing for the Prax ORM.
//!
//! Prax Tenancy provides:
//! - A current tenant per task, isolated across tasks sharing a thread
//! - Schema, database-per-tenant, shard and custom-config strategies
//! - One connection pool per tenant, reused while its configuration holds
//! - A global connection ceiling per database server
//! - `switch`, which always restores the caller's tenant
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prax_tenancy::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TenantError> {
//!     let config = TenancyConfig::from_file("tenancy.toml")?;
//!     let registry = TenantRegistry::new(config).with_source(|| load_tenant_names());
//!     let handler = ConnectionHandler::builder(PgConnector::new(), registry).build();
//!     let tenant = Tenant::new(handler);
//!
//!     tenant
//!         .run(async {
//!             tenant
//!                 .switch("acme", async {
//!                     let conn = tenant.connection().await?;
//!                     // every query on `conn` runs in acme's schema
//!                     Ok(())
//!                 })
//!                 .await
//!         })
//!         .await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Tenant context, registry, pools and the switching facade.
pub mod tenant {
    pub use prax_tenant::*;
}

/// PostgreSQL connector and tenant lifecycle.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use prax_tenant_postgres::*;
}

pub use prax_tenant::{
    ConnectionHandler, DbConfig, Role, Shard, Strategy, TenancyConfig, Tenant, TenantError,
    TenantId, TenantObserver, TenantRegistry, TenantResult, context, logging,
};

#[cfg(feature = "postgres")]
pub use prax_tenant_postgres::{PgConnector, PgTenantAdmin};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use prax_tenant::prelude::*;

    #[cfg(feature = "postgres")]
    pub use prax_tenant_postgres::prelude::*;
}
