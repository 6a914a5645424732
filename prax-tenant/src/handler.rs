//! Top-level connection routing.
//!
//! [`ConnectionHandler`] answers "a connection for (owner, tenant, role,
//! shard)": it resolves the tenant through the [`TenantRegistry`], finds or
//! creates the pool in the owner's [`PoolManager`], and leases a connection.
//! It is constructed once and shared; nothing in it is a process global.
//!
//! ```rust,ignore
//! let handler = ConnectionHandler::builder(PgConnector::new(), TenantRegistry::new(config))
//!     .observer(audit)
//!     .build();
//!
//! let conn = handler
//!     .retrieve_connection(&owner, &"acme".into(), &Role::writing(), &Shard::default_shard())
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::context::TenantId;
use crate::descriptor::{ConnectionDescriptor, ConnectionOwner, qualified_name};
use crate::error::{Selector, TenantError, TenantNotFound, TenantResult};
use crate::manager::{Establishment, PoolConfig, PoolManager, Role, Shard};
use crate::observer::{Observers, PoolEstablished, TenantObserver};
use crate::pool::{ConnectionLimits, ConnectionPool, Connector, PooledConnection};
use crate::registry::TenantRegistry;

/// Builder for [`ConnectionHandler`].
pub struct ConnectionHandlerBuilder<C: Connector> {
    connector: Arc<C>,
    registry: Arc<TenantRegistry>,
    limits: Option<ConnectionLimits>,
    observers: Observers,
}

impl<C: Connector> ConnectionHandlerBuilder<C> {
    /// Use explicit connection limits instead of the configured ceilings.
    pub fn limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Register an observer.
    pub fn observer(mut self, observer: impl TenantObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register a shared observer.
    pub fn shared_observer(mut self, observer: Arc<dyn TenantObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the handler.
    pub fn build(self) -> ConnectionHandler<C> {
        let limits = self
            .limits
            .unwrap_or_else(|| ConnectionLimits::from_config(self.registry.config()));
        ConnectionHandler {
            connector: self.connector,
            registry: self.registry,
            limits,
            managers: DashMap::new(),
            observers: self.observers,
        }
    }
}

/// Routes connection requests to tenant pools.
pub struct ConnectionHandler<C: Connector> {
    connector: Arc<C>,
    registry: Arc<TenantRegistry>,
    limits: ConnectionLimits,
    managers: DashMap<String, Arc<PoolManager<C>>>,
    observers: Observers,
}

impl<C: Connector> ConnectionHandler<C> {
    /// Create a builder.
    pub fn builder(
        connector: impl Into<Arc<C>>,
        registry: impl Into<Arc<TenantRegistry>>,
    ) -> ConnectionHandlerBuilder<C> {
        ConnectionHandlerBuilder {
            connector: connector.into(),
            registry: registry.into(),
            limits: None,
            observers: Observers::default(),
        }
    }

    /// The tenant registry.
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// The connector.
    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// The connection limits.
    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }

    fn manager(&self, owner: &str) -> Arc<PoolManager<C>> {
        if let Some(manager) = self.managers.get(owner) {
            return manager.value().clone();
        }
        self.managers
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(PoolManager::new(owner)))
            .value()
            .clone()
    }

    fn effective_tenant(&self, owner: &dyn ConnectionOwner, tenant: &TenantId) -> TenantId {
        match owner.pinned_tenant() {
            Some(pinned) => pinned.clone(),
            None => self.registry.normalize(tenant),
        }
    }

    /// Resolve the tenant and find, create or replace its pool.
    pub fn establish(
        &self,
        owner: &Arc<dyn ConnectionOwner>,
        tenant: &TenantId,
        role: &Role,
        shard: &Shard,
    ) -> TenantResult<Arc<ConnectionPool<C>>> {
        let tenant = self.effective_tenant(owner.as_ref(), tenant);

        if self.registry.config().tenant_presence_check && !self.registry.contains(&tenant) {
            return Err(TenantError::NotFound(TenantNotFound {
                connection: qualified_name(owner.base_name(), &tenant),
                tenant,
                role: role.clone(),
                shard: shard.clone(),
                unmatched: Selector::Tenant,
            }));
        }

        let resolved = self.registry.config_for(&tenant);
        resolved.db.adapter_name()?;

        let config = PoolConfig {
            descriptor: ConnectionDescriptor::new(owner.clone(), tenant),
            db: resolved.db.clone(),
            role: role.clone(),
            shard: shard.clone(),
        };
        let limiter = self.limits.limiter(&config.db.name);
        let manager = self.manager(owner.base_name());
        let (pool, outcome) = manager.establish(config, |config| {
            ConnectionPool::new(config, self.connector.clone(), limiter)
        });

        match outcome {
            Establishment::Reused => {
                debug!(pool = %pool.name(), id = pool.id(), "Reusing connection pool");
            }
            Establishment::Created | Establishment::Replaced => {
                let config = pool.pool_config();
                let event = PoolEstablished {
                    connection_name: pool.name().to_string(),
                    role: config.role.clone(),
                    shard: config.shard.clone(),
                    tenant: pool.tenant().clone(),
                    config: config.db.clone(),
                    replaced: outcome == Establishment::Replaced,
                };
                info!(
                    target: "prax_tenant::pool",
                    connection_name = %event.connection_name,
                    role = %event.role,
                    shard = %event.shard,
                    tenant = %event.tenant,
                    host = ?event.config.host,
                    database = ?event.config.database,
                    search_path = ?event.config.schema_search_path,
                    replaced = event.replaced,
                    "Connection pool established"
                );
                self.observers.pool_established(&event);
            }
        }

        Ok(pool)
    }

    /// Establish (or fetch) the pool and lease a connection from it.
    pub async fn retrieve_connection(
        &self,
        owner: &Arc<dyn ConnectionOwner>,
        tenant: &TenantId,
        role: &Role,
        shard: &Shard,
    ) -> TenantResult<PooledConnection<C>> {
        let pool = self.establish(owner, tenant, role, shard)?;
        pool.checkout().await
    }

    /// Whether a pool exists and holds a live connection. Never creates one.
    pub fn is_connected(&self, owner: &str, tenant: &TenantId, role: &Role, shard: &Shard) -> bool {
        let tenant = self.registry.normalize(tenant);
        self.managers
            .get(owner)
            .map(|manager| manager.value().clone())
            .and_then(|manager| manager.get_pool(&tenant, role, shard))
            .is_some_and(|pool| pool.is_connected())
    }

    /// Remove and disconnect a pool, returning its configuration.
    pub fn remove_connection_pool(
        &self,
        owner: &str,
        tenant: &TenantId,
        role: &Role,
        shard: &Shard,
    ) -> Option<PoolConfig> {
        let tenant = self.registry.normalize(tenant);
        let manager = self.managers.get(owner).map(|manager| manager.value().clone())?;
        let pool = manager.remove_pool(&tenant, role, shard)?;
        pool.disconnect();
        Some(pool.pool_config().clone())
    }

    /// Find a registered pool without creating one.
    ///
    /// In strict mode a miss is an error naming the unmatched selector,
    /// checked in the order connection, tenant, role, shard.
    pub fn lookup_pool(
        &self,
        owner: &str,
        tenant: &TenantId,
        role: &Role,
        shard: &Shard,
        strict: bool,
    ) -> TenantResult<Option<Arc<ConnectionPool<C>>>> {
        let tenant = self.registry.normalize(tenant);
        let found = match self.managers.get(owner).map(|manager| manager.value().clone()) {
            None => Err(Selector::Connection),
            Some(manager) => match manager.get_pool(&tenant, role, shard) {
                Some(pool) => Ok(pool),
                None if !manager.has_tenant(&tenant) => Err(Selector::Tenant),
                None if !manager.has_role(&tenant, role) => Err(Selector::Role),
                None => Err(Selector::Shard),
            },
        };

        match found {
            Ok(pool) => Ok(Some(pool)),
            Err(unmatched) if strict => Err(TenantError::NotFound(TenantNotFound {
                connection: qualified_name(owner, &tenant),
                tenant,
                role: role.clone(),
                shard: shard.clone(),
                unmatched,
            })),
            Err(_) => Ok(None),
        }
    }

    /// Find the pool, establishing it lazily when missing.
    ///
    /// Without `strict`, a tenant that cannot be resolved yields `Ok(None)`;
    /// configuration and driver errors propagate either way.
    pub fn retrieve_pool(
        &self,
        owner: &Arc<dyn ConnectionOwner>,
        tenant: &TenantId,
        role: &Role,
        shard: &Shard,
        strict: bool,
    ) -> TenantResult<Option<Arc<ConnectionPool<C>>>> {
        let tenant = self.effective_tenant(owner.as_ref(), tenant);
        if let Some(pool) = self.lookup_pool(owner.base_name(), &tenant, role, shard, false)? {
            if !pool.is_closed() {
                return Ok(Some(pool));
            }
        }

        match self.establish(owner, &tenant, role, shard) {
            Ok(pool) => Ok(Some(pool)),
            Err(err) if err.is_not_found() && !strict => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Visit every live pool of every owner.
    pub fn each_pool<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ConnectionPool<C>>),
    {
        let managers: Vec<_> = self.managers.iter().map(|m| m.value().clone()).collect();
        for manager in managers {
            manager.each_pool(|_, pool| f(pool));
        }
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.managers.iter().map(|m| m.value().len()).sum()
    }

    /// Disconnect every pool, e.g. at shutdown.
    pub fn disconnect_all(&self) {
        let managers: Vec<_> = self.managers.iter().map(|m| m.value().clone()).collect();
        for manager in managers {
            manager.disconnect_all();
        }
        info!("All tenant connection pools disconnected");
    }

    /// Invalidate cached tenant configurations.
    ///
    /// Pools are compared against the fresh configuration on their next
    /// establish and replaced if it changed.
    pub fn reload(&self) {
        self.registry.reload();
    }
}

impl<C: Connector> fmt::Debug for ConnectionHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("registry", &self.registry)
            .field("owners", &self.managers.len())
            .field("observers", &self.observers)
            .finish()
    }
}
