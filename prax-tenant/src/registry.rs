//! Tenant configuration resolution and caching.
//!
//! The registry turns a tenant name into a database-ready [`TenantConfig`]
//! under the active [`Strategy`]. Results are cached in a sharded concurrent
//! map; a miss is resolved through the map's entry API, so concurrent first
//! access to one tenant resolves once without a registry-wide lock.
//!
//! ```rust,ignore
//! let registry = TenantRegistry::new(config)
//!     .with_source(|| Ok(load_tenant_names()?.into_iter().map(TenantSpec::from).collect()));
//!
//! let acme = registry.config_for(&"acme".into());
//! assert_eq!(acme.db.schema_search_path.as_deref(), Some("\"acme\", \"shared\""));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

use crate::config::{DbConfig, DbOverride, TenancyConfig};
use crate::context::TenantId;
use crate::error::{BoxError, TenantError};
use crate::strategy::Strategy;

/// A tenant as reported by a tenant-list provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSpec {
    /// Tenant name.
    pub name: TenantId,
    /// Configuration overrides applied on top of the primary config.
    pub overrides: Option<DbOverride>,
}

impl TenantSpec {
    /// Create a bare spec.
    pub fn new(name: impl Into<TenantId>) -> Self {
        Self {
            name: name.into(),
            overrides: None,
        }
    }

    /// Attach configuration overrides.
    pub fn with_overrides(mut self, overrides: DbOverride) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

impl From<&str> for TenantSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TenantSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<TenantId> for TenantSpec {
    fn from(name: TenantId) -> Self {
        Self::new(name)
    }
}

/// Zero-argument provider of the current tenant list.
///
/// Called often; cache inside the implementation if listing is expensive.
pub trait TenantSource: Send + Sync {
    /// List the known tenants.
    fn tenants(&self) -> Result<Vec<TenantSpec>, BoxError>;
}

impl<F> TenantSource for F
where
    F: Fn() -> Result<Vec<TenantSpec>, BoxError> + Send + Sync,
{
    fn tenants(&self) -> Result<Vec<TenantSpec>, BoxError> {
        self()
    }
}

/// A fixed tenant list.
#[derive(Debug, Clone, Default)]
pub struct StaticTenants(Vec<TenantSpec>);

impl StaticTenants {
    /// Create a list from names or specs.
    pub fn new<I, T>(tenants: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TenantSpec>,
    {
        Self(tenants.into_iter().map(Into::into).collect())
    }
}

impl TenantSource for StaticTenants {
    fn tenants(&self) -> Result<Vec<TenantSpec>, BoxError> {
        Ok(self.0.clone())
    }
}

/// Resolved, immutable configuration for one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    /// The tenant.
    pub tenant: TenantId,
    /// Quoted schema or database identifier, for strategies that have one.
    pub identifier: Option<String>,
    /// Connection configuration.
    pub db: DbConfig,
}

/// Resolves and caches tenant configurations.
pub struct TenantRegistry {
    config: TenancyConfig,
    source: Option<Arc<dyn TenantSource>>,
    cache: DashMap<TenantId, Arc<TenantConfig>>,
    registered: DashSet<TenantId>,
}

impl TenantRegistry {
    /// Create a registry.
    pub fn new(config: TenancyConfig) -> Self {
        Self {
            config,
            source: None,
            cache: DashMap::new(),
            registered: DashSet::new(),
        }
    }

    /// Attach a tenant-list provider.
    pub fn with_source(mut self, source: impl TenantSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// Get the active strategy.
    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// Get the default tenant.
    pub fn default_tenant(&self) -> &TenantId {
        &self.config.default_tenant
    }

    /// Map an empty name to the default tenant.
    pub fn normalize(&self, tenant: &TenantId) -> TenantId {
        if tenant.is_empty() {
            self.config.default_tenant.clone()
        } else {
            tenant.clone()
        }
    }

    /// Resolve a tenant's configuration, caching the result.
    pub fn config_for(&self, tenant: &TenantId) -> Arc<TenantConfig> {
        let tenant = self.normalize(tenant);
        if let Some(hit) = self.cache.get(&tenant) {
            return hit.value().clone();
        }

        // Provider lookups run before the entry lock is taken.
        let overrides = self.overrides_from_source(&tenant);
        self.cache
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(self.resolve(&tenant, overrides.as_ref())))
            .value()
            .clone()
    }

    /// Store (or overwrite) the resolved configuration for a tenant.
    pub fn add_or_replace(&self, spec: impl Into<TenantSpec>) -> Arc<TenantConfig> {
        let spec = spec.into();
        let tenant = self.normalize(&spec.name);
        let resolved = Arc::new(self.resolve(&tenant, spec.overrides.as_ref()));
        self.registered.insert(tenant.clone());
        self.cache.insert(tenant, resolved.clone());
        resolved
    }

    /// Drop every cached configuration.
    pub fn reload(&self) {
        let evicted = self.cache.len();
        self.cache.clear();
        self.registered.clear();
        info!(evicted, "Tenant registry reloaded");
    }

    /// Evict one tenant's cached configuration and registration.
    pub fn forget(&self, tenant: &TenantId) -> bool {
        let tenant = self.normalize(tenant);
        let cached = self.cache.remove(&tenant).is_some();
        let registered = self.registered.remove(&tenant).is_some();
        cached || registered
    }

    /// Number of cached configurations.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// List tenant names.
    ///
    /// A failing provider is logged and yields an empty list, so a process
    /// whose tenant table is not migrated yet can still boot.
    pub fn tenant_names(&self) -> Vec<TenantId> {
        match &self.source {
            Some(source) => match source.tenants() {
                Ok(specs) => dedup(specs.into_iter().map(|spec| spec.name).collect()),
                Err(err) => {
                    let err = TenantError::TenantListUnavailable(err);
                    warn!(error = %err, code = %err.code(), "Tenant list unavailable, continuing with none");
                    Vec::new()
                }
            },
            None => {
                let mut names: Vec<_> = self.config.tenants.keys().map(TenantId::from).collect();
                names.sort();
                names
            }
        }
    }

    /// Check whether a tenant is known.
    pub fn contains(&self, tenant: &TenantId) -> bool {
        let tenant = self.normalize(tenant);
        if tenant == self.config.default_tenant
            || self.registered.contains(&tenant)
            || self.config.tenants.contains_key(tenant.as_str())
        {
            return true;
        }
        if self.source.is_none() {
            return false;
        }
        self.tenant_names().iter().any(|name| *name == tenant)
    }

    fn overrides_from_source(&self, tenant: &TenantId) -> Option<DbOverride> {
        let source = self.source.as_ref()?;
        match source.tenants() {
            Ok(specs) => specs
                .into_iter()
                .find(|spec| spec.name == *tenant)
                .and_then(|spec| spec.overrides),
            Err(err) => {
                debug!(tenant = %tenant, error = %err, "Tenant list unavailable while resolving");
                None
            }
        }
    }

    fn resolve(&self, tenant: &TenantId, overrides: Option<&DbOverride>) -> TenantConfig {
        let primary = &self.config.primary;
        let strategy = self.config.strategy;

        if *tenant == self.config.default_tenant {
            let mut db = primary.clone();
            let mut identifier = None;
            if strategy == Strategy::Schema {
                let dialect = db.dialect();
                identifier = Some(dialect.quote(tenant.as_str()));
                db.schema_search_path =
                    Some(dialect.search_path(tenant.as_str(), &self.config.persistent_schemas));
            }
            return TenantConfig {
                tenant: tenant.clone(),
                identifier,
                db,
            };
        }

        if strategy == Strategy::CustomConfig {
            let custom = overrides.or_else(|| self.config.tenants.get(tenant.as_str()));
            let db = match custom {
                Some(config) if config.has_adapter() => DbConfig::default().overlay(config),
                _ => {
                    warn!(tenant = %tenant, "No complete custom configuration, using the primary configuration");
                    primary.clone()
                }
            };
            return TenantConfig {
                tenant: tenant.clone(),
                identifier: None,
                db,
            };
        }

        let mut db = match overrides.or_else(|| self.config.tenants.get(tenant.as_str())) {
            Some(partial) => primary.overlay(partial),
            None => primary.clone(),
        };
        let name = self
            .config
            .environment_transform
            .apply(tenant.as_str(), self.config.environment.as_deref());
        let dialect = db.dialect();
        if matches!(strategy, Strategy::Schema | Strategy::DatabasePerTenant) && !dialect.fits(&name) {
            warn!(
                tenant = %tenant,
                identifier = %name,
                max_bytes = ?dialect.max_identifier_len(),
                "Tenant identifier exceeds the server identifier limit"
            );
        }

        let identifier = match strategy {
            Strategy::Schema => {
                db.schema_search_path =
                    Some(dialect.search_path(&name, &self.config.persistent_schemas));
                Some(dialect.quote(&name))
            }
            Strategy::DatabasePerTenant => {
                let identifier = dialect.quote(&name);
                db.database = Some(name);
                Some(identifier)
            }
            Strategy::Shard => {
                db.shard = Some(name);
                None
            }
            Strategy::CustomConfig => None,
        };

        debug!(tenant = %tenant, strategy = %strategy, "Resolved tenant configuration");
        TenantConfig {
            tenant: tenant.clone(),
            identifier,
            db,
        }
    }
}

impl fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("strategy", &self.config.strategy)
            .field("default_tenant", &self.config.default_tenant)
            .field("cached", &self.cache.len())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// Deduplicate tenant names, keeping the first occurrence.
pub(crate) fn dedup(names: Vec<TenantId>) -> Vec<TenantId> {
    let mut seen = HashSet::with_capacity(names.len());
    names.into_iter().filter(|name| seen.insert(name.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::EnvironmentTransform;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base() -> DbConfig {
        DbConfig::new("postgresql")
            .with_host("localhost")
            .with_database("app")
    }

    fn registry(strategy: Strategy) -> TenantRegistry {
        TenantRegistry::new(
            TenancyConfig::builder()
                .primary(base())
                .strategy(strategy)
                .persistent_schema("shared")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_schema_strategy() {
        let registry = registry(Strategy::Schema);
        let acme = registry.config_for(&"acme".into());
        assert_eq!(acme.identifier.as_deref(), Some("\"acme\""));
        assert_eq!(acme.db.schema_search_path.as_deref(), Some("\"acme\", \"shared\""));
        assert_eq!(acme.db.database.as_deref(), Some("app"));
    }

    #[test]
    fn test_database_per_tenant_strategy() {
        let registry = registry(Strategy::DatabasePerTenant);
        let acme = registry.config_for(&"acme".into());
        assert_eq!(acme.db.database.as_deref(), Some("acme"));
        assert_eq!(acme.identifier.as_deref(), Some("\"acme\""));
        assert_eq!(acme.db.schema_search_path, None);
    }

    #[test]
    fn test_shard_strategy() {
        let registry = registry(Strategy::Shard);
        let acme = registry.config_for(&"acme".into());
        assert_eq!(acme.db.shard.as_deref(), Some("acme"));
        assert_eq!(acme.db.database.as_deref(), Some("app"));
    }

    #[test]
    fn test_default_tenant_uses_primary() {
        let registry = registry(Strategy::DatabasePerTenant);
        let public = registry.config_for(&TenantId::default());
        assert_eq!(public.tenant.as_str(), "public");
        assert_eq!(public.db, base());
    }

    #[test]
    fn test_custom_config_falls_back_to_primary() {
        let config = TenancyConfig::builder()
            .primary(base())
            .strategy(Strategy::CustomConfig)
            .tenant(
                "big",
                DbOverride::new()
                    .with_adapter("postgresql")
                    .with_host("big-db")
                    .with_name("big")
                    .with_pool_size(12),
            )
            .build()
            .unwrap();
        let registry = TenantRegistry::new(config);

        let big = registry.config_for(&"big".into());
        assert_eq!(big.db.host.as_deref(), Some("big-db"));
        assert_eq!(big.db.name, "big");
        // Custom configs start from the built-in defaults, not the primary.
        assert_eq!(big.db.database, None);
        assert_eq!(big.db.pool.size, 12);
        assert_eq!(big.db.pool.checkout_timeout_ms, 5000);

        let small = registry.config_for(&"small".into());
        assert_eq!(small.db, base());
    }

    #[test]
    fn test_environment_transform_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = TenancyConfig::builder()
            .primary(base())
            .environment("test")
            .environment_transform(EnvironmentTransform::custom(move |tenant, env| {
                counter.fetch_add(1, Ordering::SeqCst);
                format!("{env}_{tenant}")
            }))
            .build()
            .unwrap();
        let registry = TenantRegistry::new(config);

        for _ in 0..3 {
            let acme = registry.config_for(&"acme".into());
            assert_eq!(acme.identifier.as_deref(), Some("\"test_acme\""));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.reload();
        registry.config_for(&"acme".into());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_first_access_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = TenancyConfig::builder()
            .primary(base())
            .environment_transform(EnvironmentTransform::custom(move |tenant, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                tenant.to_string()
            }))
            .build()
            .unwrap();
        let registry = Arc::new(TenantRegistry::new(config));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.config_for(&"acme".into()))
            })
            .collect();
        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resolved.iter().all(|c| Arc::ptr_eq(c, &resolved[0])));
    }

    #[test]
    fn test_add_or_replace() {
        let registry = registry(Strategy::Schema);
        let before = registry.config_for(&"acme".into());
        assert_eq!(before.db.host.as_deref(), Some("localhost"));

        let overrides = DbOverride::new().with_host("replica");
        let after = registry.add_or_replace(TenantSpec::new("acme").with_overrides(overrides));

        assert_eq!(after.db.host.as_deref(), Some("replica"));
        assert_eq!(registry.config_for(&"acme".into()).db.host.as_deref(), Some("replica"));
        assert!(registry.contains(&"acme".into()));

        assert!(registry.forget(&"acme".into()));
        assert!(!registry.contains(&"acme".into()));
        assert_eq!(registry.config_for(&"acme".into()).db.host.as_deref(), Some("localhost"));
        assert!(!registry.forget(&"ghost".into()));
    }

    #[test]
    fn test_tenant_list_fails_open() {
        let registry = registry(Strategy::Schema)
            .with_source(|| -> Result<Vec<TenantSpec>, BoxError> { Err("relation \"tenants\" does not exist".into()) });

        assert!(registry.tenant_names().is_empty());
        assert!(!registry.contains(&"acme".into()));
        assert!(registry.contains(&"public".into()));
        // Resolution itself still works.
        assert_eq!(registry.config_for(&"acme".into()).tenant.as_str(), "acme");
    }

    #[test]
    fn test_source_overrides_apply() {
        let overrides = DbOverride::new().with_pool_size(1);
        let registry = registry(Strategy::Schema).with_source(StaticTenants::new([
            TenantSpec::new("acme").with_overrides(overrides),
            TenantSpec::new("widgets"),
        ]));

        assert_eq!(registry.tenant_names(), vec![TenantId::new("acme"), TenantId::new("widgets")]);
        assert_eq!(registry.config_for(&"acme".into()).db.pool.size, 1);
        assert_eq!(registry.config_for(&"widgets".into()).db.pool.size, 5);
    }

    #[test]
    fn test_quoted_names_stay_distinct() {
        let registry = registry(Strategy::Schema);
        let quoted = registry.config_for(&"tenant-with-'quote".into());
        let plain = registry.config_for(&"tenant-with-quote".into());
        assert_eq!(quoted.identifier.as_deref(), Some("\"tenant-with-'quote\""));
        assert_ne!(quoted.identifier, plain.identifier);

        let unicode = "テナント-🚀".repeat(40);
        let resolved = registry.config_for(&unicode.as_str().into());
        assert_eq!(resolved.identifier, Some(format!("\"{unicode}\"")));
    }

    #[test]
    fn test_overlong_name_still_resolves() {
        let registry = registry(Strategy::DatabasePerTenant);
        let long = "t".repeat(80);
        let resolved = registry.config_for(&long.as_str().into());
        assert!(!resolved.db.dialect().fits(&long));
        assert_eq!(resolved.db.database.as_deref(), Some(long.as_str()));
    }

    #[test]
    fn test_dedup() {
        let names = vec![TenantId::new("a"), TenantId::new("b"), TenantId::new("a")];
        assert_eq!(dedup(names), vec![TenantId::new("a"), TenantId::new("b")]);
    }
}
