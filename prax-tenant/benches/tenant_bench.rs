//! Tenancy Benchmarks
//!
//! Measures the overhead the tenancy layer adds on top of the driver:
//! - Context scopes and switch round-trips
//! - Tenant configuration cache hits
//! - Warm checkouts from an established pool
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench -p prax-tenant --features testing --bench tenant_bench
//! ```

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use prax_tenant::testing::{MemoryConnector, MemoryServer};
use prax_tenant::{
    ConnectionHandler, DbConfig, Role, Shard, StaticTenants, TenancyConfig, Tenant, TenantError,
    TenantId, TenantRegistry, context, quote_identifier, Dialect,
};
use tokio::runtime::Runtime;

fn tenant_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("tenant_{i}")).collect()
}

fn setup(count: usize) -> Tenant<MemoryConnector> {
    let config = TenancyConfig::builder()
        .primary(DbConfig::new("memory").with_database("bench").with_pool_size(4))
        .max_connections("primary", 64)
        .build()
        .expect("valid config");
    let registry = TenantRegistry::new(config).with_source(StaticTenants::new(tenant_names(count)));
    let handler = ConnectionHandler::builder(MemoryConnector::new(MemoryServer::new()), registry).build();
    Tenant::new(Arc::new(handler))
}

fn bench_context(c: &mut Criterion) {
    let mut group = c.benchmark_group("tenant/context");

    group.bench_function("sync_scope", |b| {
        b.iter(|| context::sync_scope("acme", || black_box(context::current())))
    });

    group.bench_function("quote_identifier", |b| {
        b.iter(|| black_box(quote_identifier(Dialect::DoubleQuote, black_box("tenant-with-'quote\""))))
    });

    group.finish();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("tenant/registry");

    for count in [10, 1_000] {
        let tenant = setup(count);
        let registry = tenant.handler().registry().clone();
        let id = TenantId::new(format!("tenant_{}", count / 2));
        registry.config_for(&id);

        group.bench_with_input(BenchmarkId::new("config_for_cached", count), &id, |b, id| {
            b.iter(|| black_box(registry.config_for(id)))
        });
    }

    group.finish();
}

fn bench_switch(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("tenant/switch");
    let tenant = setup(100);

    group.bench_function("switch_established", |b| {
        b.to_async(&rt).iter(|| {
            let tenant = tenant.clone();
            async move {
                let result: Result<TenantId, TenantError> =
                    tenant.switch("tenant_7", async { Ok(tenant.current()) }).await;
                black_box(result)
            }
        })
    });

    group.bench_function("switch_with_checkout", |b| {
        b.to_async(&rt).iter(|| {
            let tenant = tenant.clone();
            async move {
                let result: Result<usize, TenantError> = tenant
                    .switch_with("tenant_7", |conn| async move { Ok(conn.count("users")) })
                    .await;
                black_box(result)
            }
        })
    });

    group.bench_function("warm_checkout", |b| {
        b.to_async(&rt).iter(|| {
            let handler = tenant.handler().clone();
            let owner = tenant.owner().clone();
            async move {
                let conn = handler
                    .retrieve_connection(&owner, &"tenant_3".into(), &Role::writing(), &Shard::default_shard())
                    .await;
                black_box(conn.is_ok())
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_context, bench_registry, bench_switch);
criterion_main!(benches);
