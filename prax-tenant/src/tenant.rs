//! The tenant switching facade.
//!
//! [`Tenant`] is what application code talks to. `switch` runs a body with a
//! tenant as the current one, making sure that tenant's pool is established
//! first, and puts the caller's tenant back afterwards however the body ends.
//!
//! ```rust,ignore
//! let tenant = Tenant::new(handler);
//!
//! tenant
//!     .run(async {
//!         tenant
//!             .switch("acme", async {
//!                 let conn = tenant.connection().await?;
//!                 create_invoice(&conn).await
//!             })
//!             .await
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DEFAULT_CONFIG_NAME;
use crate::context::{self, TenantId};
use crate::descriptor::{ConnectionOwner, NamedOwner};
use crate::error::{TenantError, TenantResult};
use crate::handler::ConnectionHandler;
use crate::manager::{Role, Shard};
use crate::observer::SwitchEvent;
use crate::pool::{Connector, PooledConnection};

/// Switches the current tenant and hands out tenant-scoped connections.
pub struct Tenant<C: Connector> {
    handler: Arc<ConnectionHandler<C>>,
    owner: Arc<dyn ConnectionOwner>,
}

impl<C: Connector> Clone for Tenant<C> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<C: Connector> Tenant<C> {
    /// Create a facade over `handler` for the primary connection owner.
    pub fn new(handler: impl Into<Arc<ConnectionHandler<C>>>) -> Self {
        Self::with_owner(handler, Arc::new(NamedOwner::primary(DEFAULT_CONFIG_NAME)))
    }

    /// Create a facade for a specific connection owner.
    pub fn with_owner(
        handler: impl Into<Arc<ConnectionHandler<C>>>,
        owner: Arc<dyn ConnectionOwner>,
    ) -> Self {
        Self {
            handler: handler.into(),
            owner,
        }
    }

    /// The connection handler.
    pub fn handler(&self) -> &Arc<ConnectionHandler<C>> {
        &self.handler
    }

    /// The connection owner.
    pub fn owner(&self) -> &Arc<dyn ConnectionOwner> {
        &self.owner
    }

    /// The default tenant.
    pub fn default_tenant(&self) -> &TenantId {
        self.handler.registry().default_tenant()
    }

    /// The current tenant, or the default tenant when none is set.
    pub fn current(&self) -> TenantId {
        context::current()
            .filter(|tenant| !tenant.is_empty())
            .unwrap_or_else(|| self.default_tenant().clone())
    }

    /// Run a unit of work (request, job) with a fresh tenant context.
    pub async fn run<F>(&self, f: F) -> F::Output
    where
        F: Future,
    {
        context::unit_of_work(f).await
    }

    /// Run `body` with `tenant` as the current tenant.
    ///
    /// The tenant's pool is established before the body runs; an empty name
    /// means the default tenant. Whatever happens (success, error, panic or
    /// the future being dropped) the caller's tenant is current again
    /// afterwards. Errors from the body are returned unchanged.
    pub async fn switch<Fut, T, E>(&self, tenant: impl Into<TenantId>, body: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<TenantError>,
    {
        let guard = self.begin(tenant.into());
        let target = guard.event.to.clone();

        let outcome = context::scope(target.clone(), async {
            if let Err(err) = self.activate(&target) {
                return Err(E::from(err));
            }
            body.await
        })
        .await;

        drop(guard);
        outcome
    }

    /// Like [`switch`](Self::switch), leasing a connection for the body.
    ///
    /// The connection returns to its pool when the body drops it.
    pub async fn switch_with<F, Fut, T, E>(&self, tenant: impl Into<TenantId>, body: F) -> Result<T, E>
    where
        F: FnOnce(PooledConnection<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TenantError>,
    {
        let guard = self.begin(tenant.into());
        let target = guard.event.to.clone();

        let outcome = context::scope(target.clone(), async {
            let conn = match self.connection_for(&Role::writing(), &Shard::default_shard()).await {
                Ok(conn) => conn,
                Err(err) => return Err(E::from(err)),
            };
            body(conn).await
        })
        .await;

        drop(guard);
        outcome
    }

    /// Synchronous [`switch`](Self::switch).
    pub fn switch_sync<F, T, E>(&self, tenant: impl Into<TenantId>, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<TenantError>,
    {
        let guard = self.begin(tenant.into());
        let target = guard.event.to.clone();

        let outcome = context::sync_scope(target.clone(), || {
            self.activate(&target).map_err(E::from)?;
            body()
        });

        drop(guard);
        outcome
    }

    /// Make `tenant` current for the rest of the enclosing scope, with no
    /// automatic restore.
    ///
    /// Prefer [`switch`](Self::switch). Inside an async runtime this needs an
    /// enclosing [`run`](Self::run) or switch scope, otherwise it fails with
    /// [`TenantError::ContextUnavailable`]. If the tenant cannot be
    /// established the previous tenant stays current.
    pub fn switch_now(&self, tenant: impl Into<TenantId>) -> TenantResult<()> {
        let target = self.handler.registry().normalize(&tenant.into());
        let previous = context::current();
        context::set(Some(target.clone()))?;

        if let Err(err) = self.activate(&target) {
            context::set(previous)?;
            return Err(err);
        }
        debug!(tenant = %target, "Switched tenant without restore");
        Ok(())
    }

    /// Make the default tenant current.
    pub fn reset(&self) -> TenantResult<()> {
        context::set(Some(self.default_tenant().clone()))
    }

    /// Lease a writing connection for the current tenant.
    pub async fn connection(&self) -> TenantResult<PooledConnection<C>> {
        self.connection_for(&Role::writing(), &Shard::default_shard()).await
    }

    /// Lease a connection for the current tenant, role and shard.
    pub async fn connection_for(&self, role: &Role, shard: &Shard) -> TenantResult<PooledConnection<C>> {
        self.handler
            .retrieve_connection(&self.owner, &self.current(), role, shard)
            .await
    }

    /// Run `f` once per tenant, sequentially, each inside its own switch.
    ///
    /// Stops at the first error.
    pub async fn each<I, F, Fut, E>(&self, tenants: I, mut f: F) -> Result<(), E>
    where
        I: IntoIterator,
        I::Item: Into<TenantId>,
        F: FnMut(TenantId) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<TenantError>,
    {
        for tenant in tenants {
            let tenant = tenant.into();
            self.switch(tenant.clone(), f(tenant)).await?;
        }
        Ok(())
    }

    /// [`each`](Self::each) over every tenant the registry knows.
    pub async fn each_tenant<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(TenantId) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<TenantError>,
    {
        let tenants = self.handler.registry().tenant_names();
        self.each(tenants, f).await
    }

    fn activate(&self, tenant: &TenantId) -> TenantResult<()> {
        self.handler
            .retrieve_pool(&self.owner, tenant, &Role::writing(), &Shard::default_shard(), true)
            .map(|_| ())
    }

    fn begin(&self, tenant: TenantId) -> SwitchGuard<'_, C> {
        let event = SwitchEvent {
            from: self.current(),
            to: self.handler.registry().normalize(&tenant),
        };
        debug!(from = %event.from, to = %event.to, "Switching tenant");
        self.handler.observers().before_switch(&event);
        SwitchGuard { tenant: self, event }
    }

    /// Runs once the switch scope has ended and the previous tenant is current
    /// again. If that tenant can no longer be established, fall back to the
    /// default tenant.
    fn finish(&self, event: &SwitchEvent) {
        if let Err(err) = self.activate(&event.from) {
            let default = self.default_tenant().clone();
            warn!(
                previous = %event.from,
                default = %default,
                error = %err,
                code = %err.code(),
                "Could not restore tenant, falling back to the default tenant"
            );
            self.handler.observers().restore_fallback(&event.from, &err);
            if context::set(Some(default)).is_err() {
                debug!("No enclosing tenant scope, the default tenant is implied");
            }
        }
        self.handler.observers().after_switch(event);
    }
}

/// Finishes a switch when dropped, so the after-switch hooks fire even when
/// the body panics or its future is dropped.
struct SwitchGuard<'a, C: Connector> {
    tenant: &'a Tenant<C>,
    event: SwitchEvent,
}

impl<C: Connector> Drop for SwitchGuard<'_, C> {
    fn drop(&mut self) {
        self.tenant.finish(&self.event);
    }
}

impl<C: Connector> fmt::Debug for Tenant<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("owner", &self.owner.name())
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, TenancyConfig};
    use crate::error::BoxError;
    use crate::observer::RecordingObserver;
    use crate::registry::{StaticTenants, TenantRegistry, TenantSpec};
    use crate::testing::{MemoryConnector, MemoryServer};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        tenant: Tenant<MemoryConnector>,
        server: Arc<MemoryServer>,
        names: Arc<Mutex<Vec<String>>>,
        recorder: Arc<RecordingObserver>,
    }

    fn fixture() -> Fixture {
        let config = TenancyConfig::builder()
            .primary(DbConfig::new("memory").with_database("app"))
            .build()
            .unwrap();
        let names = Arc::new(Mutex::new(vec!["acme".to_string(), "widgets".to_string()]));
        let source = {
            let names = names.clone();
            move || -> Result<Vec<TenantSpec>, BoxError> {
                Ok(names.lock().iter().map(|name| TenantSpec::from(name.as_str())).collect())
            }
        };
        let server = MemoryServer::new();
        let recorder = Arc::new(RecordingObserver::default());
        let handler = ConnectionHandler::builder(
            MemoryConnector::new(server.clone()),
            TenantRegistry::new(config).with_source(source),
        )
        .shared_observer(recorder.clone())
        .build();

        Fixture {
            tenant: Tenant::new(handler),
            server,
            names,
            recorder,
        }
    }

    #[tokio::test]
    async fn test_switch_sets_and_restores() {
        let fx = fixture();
        let tenant = &fx.tenant;

        tenant
            .run(async {
                assert_eq!(tenant.current(), TenantId::new("public"));
                let seen: TenantResult<TenantId> = tenant.switch("acme", async { Ok(tenant.current()) }).await;
                assert_eq!(seen.unwrap(), TenantId::new("acme"));
                assert_eq!(tenant.current(), TenantId::new("public"));
            })
            .await;

        let switches = fx.recorder.switches.lock();
        assert_eq!(
            switches.as_slice(),
            &[SwitchEvent {
                from: TenantId::new("public"),
                to: TenantId::new("acme"),
            }]
        );
    }

    #[tokio::test]
    async fn test_nested_switch_restores_outer() {
        let fx = fixture();
        let tenant = &fx.tenant;

        let result: TenantResult<()> = tenant
            .switch("acme", async {
                tenant
                    .switch("widgets", async {
                        assert_eq!(tenant.current(), TenantId::new("widgets"));
                        Ok(())
                    })
                    .await?;
                assert_eq!(tenant.current(), TenantId::new("acme"));
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(tenant.current(), TenantId::new("public"));
    }

    #[tokio::test]
    async fn test_body_error_propagates_and_restores() {
        #[derive(Debug, PartialEq)]
        enum AppError {
            Boom,
            Tenant(String),
        }
        impl From<TenantError> for AppError {
            fn from(err: TenantError) -> Self {
                AppError::Tenant(err.to_string())
            }
        }

        let fx = fixture();
        let tenant = &fx.tenant;
        tenant
            .run(async {
                tenant.switch_now("widgets").unwrap();
                let result: Result<(), AppError> = tenant.switch("acme", async { Err(AppError::Boom) }).await;
                assert_eq!(result, Err(AppError::Boom));
                assert_eq!(tenant.current(), TenantId::new("widgets"));

                let missing: Result<(), AppError> = tenant.switch("ghost", async { Ok(()) }).await;
                assert!(matches!(missing, Err(AppError::Tenant(_))));
                assert_eq!(tenant.current(), TenantId::new("widgets"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_empty_tenant_is_default() {
        let fx = fixture();
        let tenant = &fx.tenant;
        let seen: TenantResult<TenantId> = tenant.switch("", async { Ok(tenant.current()) }).await;
        assert_eq!(seen.unwrap(), TenantId::new("public"));
    }

    #[tokio::test]
    async fn test_switch_with_leases_scoped_connection() {
        let fx = fixture();
        let tenant = &fx.tenant;

        let result: TenantResult<()> = tenant
            .switch_with("acme", |conn| async move {
                conn.insert("users", "alice");
                Ok(())
            })
            .await;
        result.unwrap();

        assert_eq!(fx.server.rows("app", "acme", "users"), vec!["alice".to_string()]);
        assert!(fx.server.rows("app", "public", "users").is_empty());
    }

    #[tokio::test]
    async fn test_switch_now_requires_scope_in_runtime() {
        let fx = fixture();
        let tenant = &fx.tenant;

        assert!(matches!(
            tenant.switch_now("acme"),
            Err(TenantError::ContextUnavailable)
        ));

        tenant
            .run(async {
                tenant.switch_now("acme").unwrap();
                assert_eq!(tenant.current(), TenantId::new("acme"));

                assert!(tenant.switch_now("ghost").unwrap_err().is_not_found());
                assert_eq!(tenant.current(), TenantId::new("acme"));

                tenant.reset().unwrap();
                assert_eq!(tenant.current(), TenantId::new("public"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_default() {
        let fx = fixture();
        let tenant = &fx.tenant;
        let handler = tenant.handler().clone();

        tenant
            .run(async {
                let result: TenantResult<()> = tenant
                    .switch("acme", async {
                        tenant
                            .switch("widgets", async {
                                // The outer tenant disappears while the inner body runs.
                                fx.names.lock().retain(|name| name != "acme");
                                handler.remove_connection_pool(
                                    "primary",
                                    &"acme".into(),
                                    &Role::writing(),
                                    &Shard::default_shard(),
                                );
                                handler.reload();
                                Ok(())
                            })
                            .await?;
                        assert_eq!(tenant.current(), TenantId::new("public"));
                        Ok(())
                    })
                    .await;
                assert!(result.is_ok());
            })
            .await;

        assert_eq!(fx.recorder.fallbacks.lock().as_slice(), &[TenantId::new("acme")]);
    }

    #[tokio::test]
    async fn test_each_visits_every_tenant() {
        let fx = fixture();
        let tenant = &fx.tenant;
        let visited = Arc::new(Mutex::new(Vec::new()));

        let result: TenantResult<()> = tenant
            .each_tenant(|name| {
                let visited = visited.clone();
                async move {
                    assert_eq!(tenant.current(), name);
                    let conn = tenant.connection().await?;
                    conn.insert("jobs", name.as_str());
                    visited.lock().push(name);
                    Ok(())
                }
            })
            .await;
        result.unwrap();

        assert_eq!(
            visited.lock().as_slice(),
            &[TenantId::new("acme"), TenantId::new("widgets")]
        );
        assert_eq!(fx.server.rows("app", "widgets", "jobs"), vec!["widgets".to_string()]);
    }

    #[test]
    fn test_switch_sync_restores_after_panic() {
        let fx = fixture();
        let tenant = &fx.tenant;

        context::sync_unit_of_work(|| {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _: TenantResult<()> = tenant.switch_sync("acme", || panic!("body failed"));
            }));
            assert!(outcome.is_err());
            assert_eq!(tenant.current(), TenantId::new("public"));
            assert_eq!(
                fx.recorder.switches.lock().as_slice(),
                &[SwitchEvent {
                    from: TenantId::new("public"),
                    to: TenantId::new("acme"),
                }]
            );

            let seen: TenantResult<TenantId> = tenant.switch_sync("widgets", || Ok(tenant.current()));
            assert_eq!(seen.unwrap(), TenantId::new("widgets"));
        });
    }

    #[tokio::test]
    async fn test_cancelled_switch_with_returns_connection() {
        let config = TenancyConfig::builder()
            .primary(DbConfig::new("memory").with_database("app").with_pool_size(1))
            .build()
            .unwrap();
        let recorder = Arc::new(RecordingObserver::default());
        let handler = ConnectionHandler::builder(
            MemoryConnector::new(MemoryServer::new()),
            TenantRegistry::new(config).with_source(StaticTenants::new(["acme"])),
        )
        .shared_observer(recorder.clone())
        .build();
        let tenant = Tenant::new(handler);

        tenant
            .run(async {
                let cancelled = tokio::time::timeout(
                    Duration::from_millis(20),
                    tenant.switch_with("acme", |_conn| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<(), TenantError>(())
                    }),
                )
                .await;
                assert!(cancelled.is_err());
                assert_eq!(tenant.current(), TenantId::new("public"));

                // The single connection went back to the pool and can be leased again.
                let pool = tenant
                    .handler()
                    .lookup_pool("primary", &"acme".into(), &Role::writing(), &Shard::default_shard(), true)
                    .unwrap()
                    .unwrap();
                let status = pool.status();
                assert_eq!((status.open, status.idle, status.leased), (1, 1, 0));

                let result: TenantResult<()> = tenant
                    .switch_with("acme", |conn| async move {
                        conn.insert("users", "bob");
                        Ok(())
                    })
                    .await;
                result.unwrap();
            })
            .await;

        assert_eq!(
            recorder.switches.lock().as_slice(),
            &[
                SwitchEvent {
                    from: TenantId::new("public"),
                    to: TenantId::new("acme"),
                },
                SwitchEvent {
                    from: TenantId::new("public"),
                    to: TenantId::new("acme"),
                },
            ]
        );
    }
}
