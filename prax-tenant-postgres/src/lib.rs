//! # prax-tenant-postgres
//!
//! PostgreSQL connector for tenant-scoped Prax connection pools.
//!
//! This crate provides:
//! - A [`Connector`](prax_tenant::Connector) over `tokio-postgres` that applies
//!   the tenant's resolved search path on connect
//! - Tenant schema/database creation and removal
//!
//! ## Example
//!
//! ```rust,ignore
//! use prax_tenant::prelude::*;
//! use prax_tenant_postgres::PgConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TenancyConfig::from_file("tenancy.toml")?;
//!     let handler = ConnectionHandler::builder(PgConnector::new(), TenantRegistry::new(config)).build();
//!     let tenant = Tenant::new(handler);
//!
//!     tenant
//!         .run(async {
//!             tenant
//!                 .switch("acme", async {
//!                     let conn = tenant.connection().await?;
//!                     conn.execute("INSERT INTO users (name) VALUES ($1)", &[&"alice"]).await?;
//!                     Ok::<_, Box<dyn std::error::Error>>(())
//!                 })
//!                 .await
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod connector;
pub mod error;

pub use admin::PgTenantAdmin;
pub use connector::{PgConnection, PgConnector};
pub use error::{PgError, PgResult};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::admin::PgTenantAdmin;
    pub use crate::connector::{PgConnection, PgConnector};
    pub use crate::error::{PgError, PgResult};
}
