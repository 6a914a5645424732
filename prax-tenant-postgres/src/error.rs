//! Error types for the PostgreSQL tenancy adapter.

use prax_tenant::TenantError;
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur in the PostgreSQL adapter.
#[derive(Error, Debug)]
pub enum PgError {
    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The tenant's schema or database already exists.
    #[error("tenant '{0}' already exists")]
    Exists(String),

    /// Tenancy error raised while leasing a connection.
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if the schema or database being created already exists.
    pub fn is_duplicate_object(&self) -> bool {
        match self {
            Self::Postgres(e) => is_duplicate(e),
            Self::Exists(_) => true,
            _ => false,
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Postgres(e) => e.is_closed() || e.code().is_none(),
            Self::Tenant(e) => matches!(e, TenantError::Connection(_)),
            Self::Config(_) | Self::Exists(_) => false,
        }
    }
}

fn is_duplicate(err: &tokio_postgres::Error) -> bool {
    matches!(
        err.code(),
        Some(code) if *code == SqlState::DUPLICATE_SCHEMA || *code == SqlState::DUPLICATE_DATABASE
    )
}

impl From<PgError> for TenantError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Postgres(e) if is_duplicate(&e) => {
                let detail = e.as_db_error().map_or_else(|| e.to_string(), |db| db.message().to_string());
                TenantError::Exists(detail)
            }
            PgError::Postgres(e) => TenantError::connection(e),
            PgError::Exists(tenant) => TenantError::Exists(tenant),
            PgError::Config(msg) => TenantError::Configuration(msg),
            PgError::Tenant(e) => e,
        }
    }
}
