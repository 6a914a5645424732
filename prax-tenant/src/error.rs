//! Error types for tenant resolution, pooling and context switching.
//!
//! Every error carries a stable [`ErrorCode`] so callers can branch on the
//! failure class without matching on message text:
//!
//! - 3xxx: Connection errors (driver failures, exhausted or closed pools)
//! - 7xxx: Configuration errors (raised at setup, never retried)
//! - 9xxx: Tenant errors (not found, already exists, context unavailable)
//!
//! ```rust
//! use prax_tenant::{ErrorCode, Role, Selector, Shard, TenantError, TenantNotFound};
//!
//! let err = TenantError::NotFound(TenantNotFound {
//!     tenant: "acme".into(),
//!     role: Role::writing(),
//!     shard: Shard::default_shard(),
//!     connection: "primary[acme]".to_string(),
//!     unmatched: Selector::Tenant,
//! });
//! assert_eq!(err.code(), ErrorCode::TenantNotFound);
//! assert!(err.to_string().contains("tenant 'acme'"));
//! ```

use std::fmt;

use thiserror::Error;

use crate::context::TenantId;
use crate::manager::{Role, Shard};

/// Result type for tenancy operations.
pub type TenantResult<T> = Result<T, TenantError>;

/// Boxed error type used for driver and provider failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Database connection failed (P3001).
    ConnectionFailed = 3001,
    /// Connection pool exhausted (P3002).
    PoolExhausted = 3002,
    /// Connection pool was disconnected (P3006).
    PoolClosed = 3006,
    /// Invalid configuration (P7001).
    InvalidConfiguration = 7001,
    /// Tenant could not be resolved (P9001).
    TenantNotFound = 9001,
    /// Tenant already exists (P9002).
    TenantExists = 9002,
    /// Tenant list provider failed (P9003).
    TenantListUnavailable = 9003,
    /// No execution-unit scope to hold the tenant (P9004).
    ContextUnavailable = 9004,
}

impl ErrorCode {
    /// Get the error code string (e.g., "P9001").
    pub fn code(&self) -> String {
        format!("P{}", *self as u16)
    }

    /// Get a short description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "Database connection failed",
            Self::PoolExhausted => "Connection pool exhausted",
            Self::PoolClosed => "Connection pool closed",
            Self::InvalidConfiguration => "Invalid configuration",
            Self::TenantNotFound => "Tenant not found",
            Self::TenantExists => "Tenant already exists",
            Self::TenantListUnavailable => "Tenant list unavailable",
            Self::ContextUnavailable => "Tenant context unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The lookup selector that failed to match during strict pool retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// No pool or configuration exists for the tenant.
    Tenant,
    /// The tenant has pools, but none for the requested role.
    Role,
    /// The tenant and role have pools, but none for the requested shard.
    Shard,
    /// The owning connection has never been established.
    Connection,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tenant => "tenant",
            Self::Role => "role",
            Self::Shard => "shard",
            Self::Connection => "connection",
        })
    }
}

/// Details of a failed strict lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantNotFound {
    /// Requested tenant.
    pub tenant: TenantId,
    /// Requested role.
    pub role: Role,
    /// Requested shard.
    pub shard: Shard,
    /// Connection (descriptor) name the lookup targeted.
    pub connection: String,
    /// Which selector did not match.
    pub unmatched: Selector,
}

impl fmt::Display for TenantNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tenant '{}', role '{}', shard '{}', connection '{}': no connection pool found (unmatched {})",
            self.tenant, self.role, self.shard, self.connection, self.unmatched
        )
    }
}

/// Errors raised by the tenancy layer.
#[derive(Error, Debug)]
pub enum TenantError {
    /// Fatal setup error: missing adapter, conflicting strategies, bad values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Strict lookup or presence check failed.
    #[error("{0}")]
    NotFound(TenantNotFound),

    /// The tenant's schema or database already exists.
    #[error("tenant already exists: {0}")]
    Exists(String),

    /// No connection became available before the checkout timeout.
    #[error("connection pool '{pool}' exhausted: no connection available within {timeout_ms}ms")]
    PoolExhausted {
        /// Descriptor name of the pool.
        pool: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The pool was disconnected while (or before) checking out.
    #[error("connection pool '{0}' has been disconnected")]
    PoolClosed(String),

    /// The tenant-list provider failed.
    #[error("tenant list unavailable: {0}")]
    TenantListUnavailable(#[source] BoxError),

    /// `switch_now` was called inside a runtime without a unit-of-work scope.
    #[error("no tenant context scope is active for this task; wrap the unit of work in `unit_of_work`")]
    ContextUnavailable,

    /// Underlying driver error, passed through unchanged.
    #[error(transparent)]
    Connection(BoxError),
}

impl TenantError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap a driver error.
    pub fn connection<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Connection(err.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration(_) => ErrorCode::InvalidConfiguration,
            Self::NotFound(_) => ErrorCode::TenantNotFound,
            Self::Exists(_) => ErrorCode::TenantExists,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::PoolClosed(_) => ErrorCode::PoolClosed,
            Self::TenantListUnavailable(_) => ErrorCode::TenantListUnavailable,
            Self::ContextUnavailable => ErrorCode::ContextUnavailable,
            Self::Connection(_) => ErrorCode::ConnectionFailed,
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Check if this is a checkout timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }

    /// Get the not-found details, if any.
    pub fn not_found(&self) -> Option<&TenantNotFound> {
        match self {
            Self::NotFound(details) => Some(details),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found(unmatched: Selector) -> TenantError {
        TenantError::NotFound(TenantNotFound {
            tenant: TenantId::new("acme"),
            role: Role::reading(),
            shard: Shard::new("eu"),
            connection: "primary[acme]".to_string(),
            unmatched,
        })
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::TenantNotFound.code(), "P9001");
        assert_eq!(ErrorCode::PoolExhausted.code(), "P3002");
        assert_eq!(
            TenantError::config("strategy conflicts").code(),
            ErrorCode::InvalidConfiguration
        );
    }

    #[test]
    fn test_not_found_names_every_selector() {
        let message = not_found(Selector::Shard).to_string();
        assert!(message.contains("tenant 'acme'"));
        assert!(message.contains("role 'reading'"));
        assert!(message.contains("shard 'eu'"));
        assert!(message.contains("connection 'primary[acme]'"));
        assert!(message.ends_with("(unmatched shard)"));
    }

    #[test]
    fn test_retryable() {
        let exhausted = TenantError::PoolExhausted {
            pool: "primary[acme]".to_string(),
            timeout_ms: 50,
        };
        assert!(exhausted.is_retryable());
        assert!(!not_found(Selector::Tenant).is_retryable());
        assert!(!TenantError::config("bad").is_retryable());
    }

    #[test]
    fn test_driver_errors_pass_through() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TenantError::connection(io);
        assert_eq!(err.to_string(), "refused");
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }
}
