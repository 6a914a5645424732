//! Per-execution-unit tenant context.
//!
//! The current tenant lives in a Tokio task-local cell, so every task carries
//! its own value even when many tasks are multiplexed onto one OS thread.
//! A scope owns its cell: whatever the code inside it does, the enclosing value
//! is back in place once the scope ends, including when the future is dropped
//! mid-flight or the body panics.
//!
//! # Example
//!
//! ```rust
//! use prax_tenant::context::{self, TenantId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! context::unit_of_work(async {
//!     assert_eq!(context::current(), None);
//!
//!     context::scope("acme", async {
//!         assert_eq!(context::current(), Some(TenantId::new("acme")));
//!     })
//!     .await;
//!
//!     assert_eq!(context::current(), None);
//! })
//! .await;
//! # }
//! ```
//!
//! Outside any scope the behaviour depends on the thread. A plain OS thread
//! with no Tokio runtime is one unit of work for its whole life, so a
//! thread-local slot stands in. Inside a runtime with no scope there is no
//! safe place to keep a value: [`current`] reports no tenant and [`set`]
//! fails with [`TenantError::ContextUnavailable`].

use std::cell::RefCell;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{TenantError, TenantResult};

/// A unique identifier for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new tenant ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Empty IDs stand for the default tenant.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&String> for TenantId {
    fn from(s: &String) -> Self {
        Self::new(s.clone())
    }
}

impl From<&TenantId> for TenantId {
    fn from(id: &TenantId) -> Self {
        id.clone()
    }
}

impl From<uuid::Uuid> for TenantId {
    fn from(u: uuid::Uuid) -> Self {
        Self::new(u.to_string())
    }
}

impl From<i64> for TenantId {
    fn from(i: i64) -> Self {
        Self::new(i.to_string())
    }
}

impl From<i32> for TenantId {
    fn from(i: i32) -> Self {
        Self::new(i.to_string())
    }
}

tokio::task_local! {
    /// Tenant for the innermost scope of the running task.
    static TASK_TENANT: RefCell<Option<TenantId>>;
}

thread_local! {
    /// Fallback for threads that never enter a Tokio runtime.
    static THREAD_TENANT: RefCell<Option<TenantId>> = const { RefCell::new(None) };
}

#[inline]
fn outside_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_err()
}

/// Run a unit of work (request, job, console command) with a fresh, empty
/// tenant context.
///
/// Nothing from a previous unit handled by the same worker leaks in.
pub async fn unit_of_work<F>(f: F) -> F::Output
where
    F: Future,
{
    TASK_TENANT.scope(RefCell::new(None), f).await
}

/// Synchronous counterpart of [`unit_of_work`].
pub fn sync_unit_of_work<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    TASK_TENANT.sync_scope(RefCell::new(None), f)
}

/// Run a future with `tenant` as the current tenant.
pub async fn scope<F>(tenant: impl Into<TenantId>, f: F) -> F::Output
where
    F: Future,
{
    TASK_TENANT.scope(RefCell::new(Some(tenant.into())), f).await
}

/// Run a closure with `tenant` as the current tenant.
pub fn sync_scope<F, R>(tenant: impl Into<TenantId>, f: F) -> R
where
    F: FnOnce() -> R,
{
    TASK_TENANT.sync_scope(RefCell::new(Some(tenant.into())), f)
}

/// Wrap a future so it carries the caller's current tenant.
///
/// Spawned tasks start without a tenant; use this when a child task should
/// keep working for the tenant that spawned it.
///
/// ```rust,ignore
/// tokio::spawn(context::inherit(async move { send_invoice(id).await }));
/// ```
pub fn inherit<F>(f: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let tenant = current();
    TASK_TENANT.scope(RefCell::new(tenant), f)
}

/// Get the current tenant, if one is set.
#[inline]
pub fn current() -> Option<TenantId> {
    match TASK_TENANT.try_with(|cell| cell.borrow().clone()) {
        Ok(tenant) => tenant,
        Err(_) if outside_runtime() => THREAD_TENANT.with(|cell| cell.borrow().clone()),
        Err(_) => None,
    }
}

/// Replace the current tenant for the innermost scope.
///
/// The value lasts until the scope ends or the next `set`.
pub fn set(tenant: Option<TenantId>) -> TenantResult<()> {
    if TASK_TENANT
        .try_with(|cell| {
            cell.replace(tenant.clone());
        })
        .is_ok()
    {
        return Ok(());
    }

    if outside_runtime() {
        THREAD_TENANT.with(|cell| {
            cell.replace(tenant);
        });
        Ok(())
    } else {
        Err(TenantError::ContextUnavailable)
    }
}

/// Check whether the running code is inside a tenant scope.
#[inline]
pub fn in_scope() -> bool {
    TASK_TENANT.try_with(|_| ()).is_ok()
}
