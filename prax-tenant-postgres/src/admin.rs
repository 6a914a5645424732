//! Tenant schema and database lifecycle.
//!
//! ```rust,ignore
//! let admin = PgTenantAdmin::new(handler.clone());
//! admin.create_tenant(&"acme".into()).await?;
//! ```

use std::sync::Arc;

use prax_tenant::{
    ConnectionHandler, ConnectionOwner, DEFAULT_CONFIG_NAME, NamedOwner, Role, Shard, Strategy,
    TenantId,
};
use tracing::info;

use crate::connector::PgConnector;
use crate::error::{PgError, PgResult};

/// Creates and drops tenant schemas or databases on the primary server.
pub struct PgTenantAdmin {
    handler: Arc<ConnectionHandler<PgConnector>>,
    owner: Arc<dyn ConnectionOwner>,
}

impl PgTenantAdmin {
    /// Create an admin for the primary connection owner.
    pub fn new(handler: Arc<ConnectionHandler<PgConnector>>) -> Self {
        Self {
            handler,
            owner: Arc::new(NamedOwner::primary(DEFAULT_CONFIG_NAME)),
        }
    }

    /// Create the tenant's schema (schema strategy) or database
    /// (database-per-tenant strategy) and register the tenant.
    pub async fn create_tenant(&self, tenant: &TenantId) -> PgResult<()> {
        let registry = self.handler.registry();
        let resolved = registry.config_for(tenant);
        let identifier = identifier_for(registry.strategy(), resolved.identifier.as_deref())?;
        let sql = create_statement(registry.strategy(), identifier)?;

        self.execute_on_default(&sql).await.map_err(|err| {
            if err.is_duplicate_object() {
                PgError::Exists(tenant.to_string())
            } else {
                err
            }
        })?;

        registry.add_or_replace(tenant.clone());
        info!(tenant = %tenant, strategy = %registry.strategy(), "Tenant created");
        Ok(())
    }

    /// Drop the tenant's schema or database, disconnect its pools and evict
    /// it from the registry.
    pub async fn drop_tenant(&self, tenant: &TenantId) -> PgResult<()> {
        let registry = self.handler.registry();
        if tenant.is_empty() || tenant == registry.default_tenant() {
            return Err(PgError::config("the default tenant cannot be dropped"));
        }

        let resolved = registry.config_for(tenant);
        let identifier = identifier_for(registry.strategy(), resolved.identifier.as_deref())?;
        let sql = drop_statement(registry.strategy(), identifier)?;

        // A database cannot be dropped while its own pool holds connections.
        self.handler.remove_connection_pool(
            self.owner.base_name(),
            tenant,
            &Role::writing(),
            &Shard::default_shard(),
        );
        self.execute_on_default(&sql).await?;
        registry.forget(tenant);

        info!(tenant = %tenant, strategy = %registry.strategy(), "Tenant dropped");
        Ok(())
    }

    async fn execute_on_default(&self, sql: &str) -> PgResult<()> {
        let default = self.handler.registry().default_tenant().clone();
        let conn = self
            .handler
            .retrieve_connection(&self.owner, &default, &Role::writing(), &Shard::default_shard())
            .await?;
        conn.batch_execute(sql).await
    }
}

fn identifier_for(strategy: Strategy, identifier: Option<&str>) -> PgResult<&str> {
    identifier.ok_or_else(|| {
        PgError::config(format!(
            "tenant creation is not supported for the '{}' strategy",
            strategy
        ))
    })
}

/// DDL creating a tenant. `identifier` is already quoted.
pub(crate) fn create_statement(strategy: Strategy, identifier: &str) -> PgResult<String> {
    match strategy {
        Strategy::Schema => Ok(format!("CREATE SCHEMA {}", identifier)),
        Strategy::DatabasePerTenant => Ok(format!("CREATE DATABASE {}", identifier)),
        other => Err(PgError::config(format!(
            "tenant creation is not supported for the '{}' strategy",
            other
        ))),
    }
}

/// DDL dropping a tenant. `identifier` is already quoted.
pub(crate) fn drop_statement(strategy: Strategy, identifier: &str) -> PgResult<String> {
    match strategy {
        Strategy::Schema => Ok(format!("DROP SCHEMA {} CASCADE", identifier)),
        Strategy::DatabasePerTenant => Ok(format!("DROP DATABASE {}", identifier)),
        other => Err(PgError::config(format!(
            "tenant removal is not supported for the '{}' strategy",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use prax_tenant::{Dialect, quote_identifier};

    #[test]
    fn test_schema_statements() {
        let id = quote_identifier(Dialect::DoubleQuote, "acme");
        assert_eq!(create_statement(Strategy::Schema, &id).unwrap(), "CREATE SCHEMA \"acme\"");
        assert_eq!(drop_statement(Strategy::Schema, &id).unwrap(), "DROP SCHEMA \"acme\" CASCADE");
    }

    #[test]
    fn test_database_statements_quote_hostile_names() {
        let id = quote_identifier(Dialect::DoubleQuote, "x\"; DROP DATABASE prod; --");
        assert_eq!(
            create_statement(Strategy::DatabasePerTenant, &id).unwrap(),
            "CREATE DATABASE \"x\"\"; DROP DATABASE prod; --\""
        );
    }

    #[test]
    fn test_unsupported_strategies() {
        assert!(create_statement(Strategy::Shard, "\"a\"").is_err());
        assert!(drop_statement(Strategy::CustomConfig, "\"a\"").is_err());
        assert!(identifier_for(Strategy::Shard, None).is_err());
        assert_eq!(identifier_for(Strategy::Schema, Some("\"a\"")).unwrap(), "\"a\"");
    }
}
