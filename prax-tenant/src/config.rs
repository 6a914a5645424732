//! Connection and tenancy configuration.
//!
//! [`DbConfig`] describes one database connection (the primary, or a
//! per-tenant override). [`TenancyConfig`] is the whole configuration surface:
//! strategy, default tenant, environment transform, persistent schemas, global
//! connection ceilings and per-tenant overrides.
//!
//! ```toml
//! default_tenant = "public"
//! strategy = "schema"
//! environment = "production"
//! environment_transform = "prepend"
//! persistent_schemas = ["shared_extensions"]
//!
//! [primary]
//! adapter = "postgresql"
//! host = "db.internal"
//! database = "app"
//! pool = { size = 5, checkout_timeout_ms = 2000 }
//!
//! [max_connections]
//! primary = 20
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::context::TenantId;
use crate::error::{TenantError, TenantResult};
use crate::quote::Dialect;
use crate::strategy::{EnvironmentTransform, Strategy, TransformKind};

/// Name of the base configuration when none is given.
pub const DEFAULT_CONFIG_NAME: &str = "primary";

/// Per-pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum physical connections this pool may hold.
    pub size: usize,
    /// How long a checkout waits before failing with `PoolExhausted`.
    pub checkout_timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 5,
            checkout_timeout_ms: 5000,
        }
    }
}

impl PoolOptions {
    /// Checkout timeout as a [`Duration`].
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

/// Pool sizing set by a tenant override; unset fields keep the base value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOverride {
    /// Maximum physical connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Checkout timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_timeout_ms: Option<u64>,
}

impl PoolOverride {
    fn apply(&self, pool: &mut PoolOptions) {
        if let Some(size) = self.size {
            pool.size = size;
        }
        if let Some(timeout) = self.checkout_timeout_ms {
            pool.checkout_timeout_ms = timeout;
        }
    }
}

/// Database connection configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Base configuration name; connections are counted against its ceiling.
    pub name: String,
    /// Adapter (driver) name, e.g. `postgresql`.
    pub adapter: Option<String>,
    /// Host.
    pub host: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// Database name.
    pub database: Option<String>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Already-quoted search path applied on connect.
    pub schema_search_path: Option<String>,
    /// Shard key.
    pub shard: Option<String>,
    /// Pool sizing.
    pub pool: PoolOptions,
    /// Adapter-specific options.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CONFIG_NAME.to_string(),
            adapter: None,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            schema_search_path: None,
            shard: None,
            pool: PoolOptions::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("name", &self.name)
            .field("adapter", &self.adapter)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("schema_search_path", &self.schema_search_path)
            .field("shard", &self.shard)
            .field("pool", &self.pool)
            .field("extra", &self.extra)
            .finish()
    }
}

impl DbConfig {
    /// Create a configuration for an adapter.
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: Some(adapter.into()),
            ..Default::default()
        }
    }

    /// Parse a database URL.
    ///
    /// Supports `postgres://`, `postgresql://`, `mysql://` and `sqlite://`.
    /// The `pool_size` and `checkout_timeout_ms` query parameters size the
    /// pool; any other parameter lands in `extra`.
    pub fn from_url(url: &str) -> TenantResult<Self> {
        // SQLite URLs carry a path, not an authority, so they skip `Url`.
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let rest = rest.trim_start_matches("//");
            let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
            let mut config = Self::new("sqlite");
            if !path.is_empty() {
                config.database = Some(path.to_string());
            }
            config.apply_query(url::form_urlencoded::parse(query.as_bytes()))?;
            return Ok(config);
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| TenantError::config(format!("invalid database URL: {}", e)))?;

        let adapter = match parsed.scheme() {
            "postgres" | "postgresql" => "postgresql",
            "mysql" | "mariadb" => "mysql",
            other => {
                return Err(TenantError::config(format!(
                    "unsupported database URL scheme '{}'",
                    other
                )));
            }
        };

        let mut config = Self::new(adapter);
        config.host = parsed.host_str().map(String::from);
        config.port = parsed.port();
        let database = parsed.path().trim_start_matches('/');
        if !database.is_empty() {
            config.database = Some(database.to_string());
        }
        if !parsed.username().is_empty() {
            config.username = Some(decode_userinfo(parsed.username(), "username")?);
        }
        config.password = parsed
            .password()
            .map(|password| decode_userinfo(password, "password"))
            .transpose()?;
        config.apply_query(parsed.query_pairs())?;

        Ok(config)
    }

    fn apply_query(&mut self, pairs: url::form_urlencoded::Parse<'_>) -> TenantResult<()> {
        for (key, value) in pairs {
            match &*key {
                "pool_size" => {
                    self.pool.size = value
                        .parse()
                        .map_err(|_| TenantError::config("invalid pool_size"))?;
                }
                "checkout_timeout_ms" => {
                    self.pool.checkout_timeout_ms = value
                        .parse()
                        .map_err(|_| TenantError::config("invalid checkout_timeout_ms"))?;
                }
                "search_path" | "schema_search_path" => {
                    self.schema_search_path = Some(value.into_owned());
                }
                _ => {
                    self.extra
                        .insert(key.into_owned(), serde_json::Value::String(value.into_owned()));
                }
            }
        }
        Ok(())
    }

    /// Set the base configuration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.size = size;
        self
    }

    /// Set the checkout timeout.
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool.checkout_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Get the adapter name, failing when it is unspecified.
    pub fn adapter_name(&self) -> TenantResult<&str> {
        match self.adapter.as_deref() {
            Some(adapter) if !adapter.trim().is_empty() => Ok(adapter),
            _ => Err(TenantError::config(format!(
                "database configuration '{}' does not specify an adapter",
                self.name
            ))),
        }
    }

    /// Quoting dialect for this configuration's adapter.
    pub fn dialect(&self) -> Dialect {
        self.adapter
            .as_deref()
            .map(Dialect::for_adapter)
            .unwrap_or_default()
    }

    /// Apply a partial override on top of this configuration.
    ///
    /// Fields set in `other` win, field by field; `extra` entries are merged.
    pub fn overlay(&self, other: &DbOverride) -> DbConfig {
        let mut merged = self.clone();
        if let Some(name) = &other.name {
            merged.name.clone_from(name);
        }
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    merged.$field.clone_from(&other.$field);
                })*
            };
        }
        take!(adapter, host, port, database, username, password, schema_search_path, shard);
        other.pool.apply(&mut merged.pool);
        merged
            .extra
            .extend(other.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// A partial [`DbConfig`]: per-tenant overrides and custom configurations.
///
/// Only the fields that are set replace the base configuration's.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOverride {
    /// Base configuration name.
    pub name: Option<String>,
    /// Adapter name.
    pub adapter: Option<String>,
    /// Host.
    pub host: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// Database name.
    pub database: Option<String>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Already-quoted search path.
    pub schema_search_path: Option<String>,
    /// Shard key.
    pub shard: Option<String>,
    /// Pool sizing.
    pub pool: PoolOverride,
    /// Adapter-specific options.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl fmt::Debug for DbOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbOverride")
            .field("name", &self.name)
            .field("adapter", &self.adapter)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("schema_search_path", &self.schema_search_path)
            .field("shard", &self.shard)
            .field("pool", &self.pool)
            .field("extra", &self.extra)
            .finish()
    }
}

impl DbOverride {
    /// An override that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the adapter.
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Set the base configuration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.size = Some(size);
        self
    }

    /// Set the checkout timeout.
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool.checkout_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Whether a non-blank adapter is set.
    pub fn has_adapter(&self) -> bool {
        self.adapter.as_deref().is_some_and(|adapter| !adapter.trim().is_empty())
    }
}

/// Validated tenancy configuration.
#[derive(Debug, Clone)]
pub struct TenancyConfig {
    /// Tenant used when none is set or an empty name is given.
    pub default_tenant: TenantId,
    /// Active isolation strategy.
    pub strategy: Strategy,
    /// Running environment name, e.g. `production`.
    pub environment: Option<String>,
    /// How the environment is combined with tenant names.
    pub environment_transform: EnvironmentTransform,
    /// Schemas kept in every tenant's search path (schema strategy).
    pub persistent_schemas: Vec<String>,
    /// Reject switches to tenants the registry does not know.
    pub tenant_presence_check: bool,
    /// Base configuration.
    pub primary: DbConfig,
    /// Global connection ceiling per base configuration name.
    pub max_connections: HashMap<String, usize>,
    /// Per-tenant configuration overrides.
    pub tenants: HashMap<String, DbOverride>,
}

impl TenancyConfig {
    /// Create a builder.
    pub fn builder() -> TenancyConfigBuilder {
        TenancyConfigBuilder::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> TenantResult<Self> {
        let raw: RawTenancyConfig = toml::from_str(source)
            .map_err(|e| TenantError::config(format!("invalid tenancy configuration: {}", e)))?;
        raw.into_builder()?.build()
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> TenantResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TenantError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Global ceiling for a base configuration name, if any.
    pub fn max_connections_for(&self, name: &str) -> Option<usize> {
        self.max_connections.get(name).copied()
    }

    /// Check the configuration for fatal errors.
    pub fn validate(&self) -> TenantResult<()> {
        self.primary.adapter_name()?;
        check_pool(&self.primary.name, &self.primary.pool)?;
        for (tenant, config) in &self.tenants {
            if config.pool.size == Some(0) {
                return Err(TenantError::config(format!(
                    "pool size for tenant '{}' must be greater than zero",
                    tenant
                )));
            }
        }

        if let Some((name, _)) = self.max_connections.iter().find(|(_, max)| **max == 0) {
            return Err(TenantError::config(format!(
                "max_connections for '{}' must be greater than zero",
                name
            )));
        }

        if self.strategy == Strategy::CustomConfig {
            for (tenant, config) in &self.tenants {
                if !config.has_adapter() {
                    return Err(TenantError::config(format!(
                        "custom configuration for tenant '{}' does not specify an adapter",
                        tenant
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Builder for [`TenancyConfig`].
#[derive(Debug, Default)]
pub struct TenancyConfigBuilder {
    default_tenant: Option<TenantId>,
    strategy: Option<Strategy>,
    use_schemas: Option<bool>,
    environment: Option<String>,
    environment_transform: EnvironmentTransform,
    persistent_schemas: Vec<String>,
    tenant_presence_check: Option<bool>,
    primary: Option<DbConfig>,
    max_connections: HashMap<String, usize>,
    tenants: HashMap<String, DbOverride>,
}

impl TenancyConfigBuilder {
    /// Set the default tenant.
    pub fn default_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.default_tenant = Some(tenant.into());
        self
    }

    /// Set the isolation strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Legacy toggle: `true` for schemas, `false` for database-per-tenant.
    pub fn use_schemas(mut self, use_schemas: bool) -> Self {
        self.use_schemas = Some(use_schemas);
        self
    }

    /// Set the environment name.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the environment transform.
    pub fn environment_transform(mut self, transform: EnvironmentTransform) -> Self {
        self.environment_transform = transform;
        self
    }

    /// Add a persistent schema.
    pub fn persistent_schema(mut self, schema: impl Into<String>) -> Self {
        self.persistent_schemas.push(schema.into());
        self
    }

    /// Enable or disable the tenant presence check.
    pub fn tenant_presence_check(mut self, enabled: bool) -> Self {
        self.tenant_presence_check = Some(enabled);
        self
    }

    /// Set the primary configuration.
    pub fn primary(mut self, config: DbConfig) -> Self {
        self.primary = Some(config);
        self
    }

    /// Set the global ceiling for a base configuration name.
    pub fn max_connections(mut self, name: impl Into<String>, max: usize) -> Self {
        self.max_connections.insert(name.into(), max);
        self
    }

    /// Add a per-tenant override.
    pub fn tenant(mut self, tenant: impl Into<String>, config: DbOverride) -> Self {
        self.tenants.insert(tenant.into(), config);
        self
    }

    /// Validate and build.
    pub fn build(self) -> TenantResult<TenancyConfig> {
        let strategy = match (self.strategy, self.use_schemas) {
            (Some(strategy), Some(use_schemas)) => {
                let implied = implied_strategy(use_schemas);
                if strategy != implied {
                    return Err(TenantError::config(format!(
                        "strategy '{}' conflicts with use_schemas = {}; configure only one",
                        strategy, use_schemas
                    )));
                }
                strategy
            }
            (Some(strategy), None) => strategy,
            (None, Some(use_schemas)) => implied_strategy(use_schemas),
            (None, None) => Strategy::default(),
        };

        let config = TenancyConfig {
            default_tenant: self
                .default_tenant
                .unwrap_or_else(|| TenantId::new("public")),
            strategy,
            environment: self.environment,
            environment_transform: self.environment_transform,
            persistent_schemas: self.persistent_schemas,
            tenant_presence_check: self.tenant_presence_check.unwrap_or(true),
            primary: self
                .primary
                .ok_or_else(|| TenantError::config("no primary database configuration"))?,
            max_connections: self.max_connections,
            tenants: self.tenants,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Userinfo comes back from `Url` still percent-encoded.
fn decode_userinfo(raw: &str, field: &str) -> TenantResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| TenantError::config(format!("database URL {} is not valid UTF-8", field)))
}

fn check_pool(name: &str, pool: &PoolOptions) -> TenantResult<()> {
    if pool.size == 0 {
        return Err(TenantError::config(format!(
            "pool size for '{}' must be greater than zero",
            name
        )));
    }
    Ok(())
}

fn implied_strategy(use_schemas: bool) -> Strategy {
    if use_schemas {
        Strategy::Schema
    } else {
        Strategy::DatabasePerTenant
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTenancyConfig {
    default_tenant: Option<String>,
    strategy: Option<Strategy>,
    use_schemas: Option<bool>,
    environment: Option<String>,
    #[serde(default)]
    environment_transform: TransformKind,
    #[serde(default)]
    persistent_schemas: Vec<String>,
    tenant_presence_check: Option<bool>,
    primary: Option<DbConfig>,
    database_url: Option<String>,
    #[serde(default)]
    max_connections: HashMap<String, usize>,
    #[serde(default)]
    tenants: HashMap<String, DbOverride>,
}

impl RawTenancyConfig {
    fn into_builder(self) -> TenantResult<TenancyConfigBuilder> {
        let primary = match (self.primary, self.database_url) {
            (Some(_), Some(_)) => {
                return Err(TenantError::config(
                    "set either [primary] or database_url, not both",
                ));
            }
            (Some(primary), None) => Some(primary),
            (None, Some(url)) => Some(DbConfig::from_url(&url)?),
            (None, None) => None,
        };

        Ok(TenancyConfigBuilder {
            default_tenant: self.default_tenant.map(TenantId::new),
            strategy: self.strategy,
            use_schemas: self.use_schemas,
            environment: self.environment,
            environment_transform: self.environment_transform.into(),
            persistent_schemas: self.persistent_schemas,
            tenant_presence_check: self.tenant_presence_check,
            primary,
            max_connections: self.max_connections,
            tenants: self.tenants,
        })
    }
}
