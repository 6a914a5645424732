//! Tenant isolation strategies and environment-name transforms.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The isolation strategy for multi-tenancy.
///
/// Exactly one strategy is active for a [`TenancyConfig`](crate::TenancyConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Schema-based: each tenant has its own schema in one database.
    #[default]
    Schema,
    /// Database-based: each tenant has its own database.
    DatabasePerTenant,
    /// Shard-based: the tenant name is the shard key.
    Shard,
    /// Each tenant supplies a complete connection configuration.
    CustomConfig,
}

impl Strategy {
    /// Check if this is schema-based isolation.
    pub fn is_schema_based(&self) -> bool {
        matches!(self, Self::Schema)
    }

    /// Check if this is database-based isolation.
    pub fn is_database_based(&self) -> bool {
        matches!(self, Self::DatabasePerTenant)
    }

    /// Configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::DatabasePerTenant => "database_per_tenant",
            Self::Shard => "shard",
            Self::CustomConfig => "custom_config",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied environment transform: `(tenant, environment) -> name`.
pub type TransformFn = dyn Fn(&str, &str) -> String + Send + Sync;

/// How the running environment name is combined with a tenant name.
#[derive(Clone, Default)]
pub enum EnvironmentTransform {
    /// Use the tenant name unchanged.
    #[default]
    None,
    /// `{environment}_{tenant}`.
    Prepend,
    /// `{tenant}_{environment}`.
    Append,
    /// Arbitrary transform.
    Custom(Arc<TransformFn>),
}

impl EnvironmentTransform {
    /// Create a custom transform.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Whether the transform needs an environment name to do anything.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Apply the transform.
    ///
    /// Without an environment, prepend and append leave the name alone; a
    /// custom transform receives an empty environment.
    pub fn apply(&self, tenant: &str, environment: Option<&str>) -> String {
        match (self, environment) {
            (Self::None, _) => tenant.to_string(),
            (Self::Prepend, Some(env)) => format!("{env}_{tenant}"),
            (Self::Append, Some(env)) => format!("{tenant}_{env}"),
            (Self::Prepend | Self::Append, None) => tenant.to_string(),
            (Self::Custom(f), env) => f(tenant, env.unwrap_or_default()),
        }
    }
}

impl fmt::Debug for EnvironmentTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Prepend => f.write_str("Prepend"),
            Self::Append => f.write_str("Append"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Serializable subset of [`EnvironmentTransform`] used in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// No transform.
    #[default]
    None,
    /// Prefix with the environment.
    Prepend,
    /// Suffix with the environment.
    Append,
}

impl From<TransformKind> for EnvironmentTransform {
    fn from(kind: TransformKind) -> Self {
        match kind {
            TransformKind::None => Self::None,
            TransformKind::Prepend => Self::Prepend,
            TransformKind::Append => Self::Append,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::DatabasePerTenant.to_string(), "database_per_tenant");
        assert!(Strategy::default().is_schema_based());

        let parsed: Strategy = serde_json::from_str("\"custom_config\"").unwrap();
        assert_eq!(parsed, Strategy::CustomConfig);
    }

    #[test]
    fn test_environment_transform() {
        assert_eq!(EnvironmentTransform::None.apply("acme", Some("test")), "acme");
        assert_eq!(EnvironmentTransform::Prepend.apply("acme", Some("test")), "test_acme");
        assert_eq!(EnvironmentTransform::Append.apply("acme", Some("test")), "acme_test");
        assert_eq!(EnvironmentTransform::Append.apply("acme", None), "acme");

        let custom = EnvironmentTransform::custom(|tenant, env| format!("{env}-{tenant}").to_uppercase());
        assert_eq!(custom.apply("acme", Some("prod")), "PROD-ACME");
        assert_eq!(format!("{custom:?}"), "Custom(..)");
    }
}
