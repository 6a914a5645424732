//! Per-owner pool registry.
//!
//! Each connection owner has one [`PoolManager`] holding its pools keyed by
//! `(tenant, role, shard)`. Insertion goes through the sharded map's entry
//! API, so two tasks establishing the same key never build two pools, while
//! tasks working on different tenants do not contend on one lock.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

use crate::config::DbConfig;
use crate::context::TenantId;
use crate::descriptor::ConnectionDescriptor;
use crate::pool::{ConnectionPool, Connector};

/// Connection role, e.g. `writing` or `reading`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(SmolStr);

impl Role {
    /// Create a role.
    pub fn new(role: impl AsRef<str>) -> Self {
        Self(SmolStr::new(role))
    }

    /// The writing role.
    pub fn writing() -> Self {
        Self(SmolStr::new_static("writing"))
    }

    /// The reading role.
    pub fn reading() -> Self {
        Self(SmolStr::new_static("reading"))
    }

    /// Get the role name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::writing()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(role: &str) -> Self {
        Self::new(role)
    }
}

/// Shard name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shard(SmolStr);

impl Shard {
    /// Create a shard.
    pub fn new(shard: impl AsRef<str>) -> Self {
        Self(SmolStr::new(shard))
    }

    /// The default shard.
    pub fn default_shard() -> Self {
        Self(SmolStr::new_static("default"))
    }

    /// Get the shard name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::default_shard()
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Shard {
    fn from(shard: &str) -> Self {
        Self::new(shard)
    }
}

/// Registry key of one pool inside a manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Tenant.
    pub tenant: TenantId,
    /// Role.
    pub role: Role,
    /// Shard.
    pub shard: Shard,
}

impl PoolKey {
    /// Create a key.
    pub fn new(tenant: TenantId, role: Role, shard: Shard) -> Self {
        Self { tenant, role, shard }
    }
}

/// Everything that determines one pool's identity and connection parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Tenant-qualified owner.
    pub descriptor: ConnectionDescriptor,
    /// Resolved connection configuration.
    pub db: DbConfig,
    /// Role.
    pub role: Role,
    /// Shard.
    pub shard: Shard,
}

impl PoolConfig {
    /// Registry key for this configuration.
    pub fn key(&self) -> PoolKey {
        PoolKey::new(
            self.descriptor.tenant().clone(),
            self.role.clone(),
            self.shard.clone(),
        )
    }
}

/// Outcome of [`PoolManager::establish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Establishment {
    /// An existing pool with identical configuration was returned.
    Reused,
    /// A new pool was registered.
    Created,
    /// A pool with different configuration was disconnected and replaced.
    Replaced,
}

/// Pools of one connection owner.
pub struct PoolManager<C: Connector> {
    owner: String,
    pools: DashMap<PoolKey, Arc<ConnectionPool<C>>>,
}

impl<C: Connector> PoolManager<C> {
    /// Create an empty manager for `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            pools: DashMap::new(),
        }
    }

    /// Owner base name.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Return the pool for `config`, creating or replacing it as needed.
    ///
    /// An existing open pool whose configuration equals `config.db` is reused
    /// as is. Otherwise `create` builds a new pool; a pool it replaces is
    /// disconnected once the map entry is released.
    pub fn establish<F>(&self, config: PoolConfig, create: F) -> (Arc<ConnectionPool<C>>, Establishment)
    where
        F: FnOnce(PoolConfig) -> Arc<ConnectionPool<C>>,
    {
        let (pool, replaced) = match self.pools.entry(config.key()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.is_closed() && existing.pool_config().db == config.db {
                    return (existing.clone(), Establishment::Reused);
                }
                let pool = create(config);
                let old = entry.insert(pool.clone());
                (pool, Some(old))
            }
            Entry::Vacant(entry) => {
                let pool = create(config);
                entry.insert(pool.clone());
                (pool, None)
            }
        };

        match replaced {
            Some(old) => {
                debug!(pool = %old.descriptor(), id = old.id(), "Disconnecting replaced pool");
                old.disconnect();
                (pool, Establishment::Replaced)
            }
            None => (pool, Establishment::Created),
        }
    }

    /// Get a registered pool without creating one.
    pub fn get_pool(&self, tenant: &TenantId, role: &Role, shard: &Shard) -> Option<Arc<ConnectionPool<C>>> {
        let key = PoolKey::new(tenant.clone(), role.clone(), shard.clone());
        self.pools.get(&key).map(|pool| pool.value().clone())
    }

    /// Detach a pool; the caller disconnects it.
    pub fn remove_pool(&self, tenant: &TenantId, role: &Role, shard: &Shard) -> Option<Arc<ConnectionPool<C>>> {
        let key = PoolKey::new(tenant.clone(), role.clone(), shard.clone());
        self.pools.remove(&key).map(|(_, pool)| pool)
    }

    /// Visit every live pool.
    ///
    /// Iterates over a snapshot, so `f` may call back into the manager.
    pub fn each_pool<F>(&self, mut f: F)
    where
        F: FnMut(&PoolKey, &Arc<ConnectionPool<C>>),
    {
        for (key, pool) in self.snapshot() {
            f(&key, &pool);
        }
    }

    /// Check whether any pool exists for `tenant`.
    pub fn has_tenant(&self, tenant: &TenantId) -> bool {
        self.pools.iter().any(|entry| entry.key().tenant == *tenant)
    }

    /// Check whether any pool exists for `tenant` and `role`.
    pub fn has_role(&self, tenant: &TenantId, role: &Role) -> bool {
        self.pools
            .iter()
            .any(|entry| entry.key().tenant == *tenant && entry.key().role == *role)
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Check if there are no pools.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Remove and disconnect every pool.
    pub fn disconnect_all(&self) {
        for (key, _) in self.snapshot() {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.disconnect();
            }
        }
    }

    fn snapshot(&self) -> Vec<(PoolKey, Arc<ConnectionPool<C>>)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl<C: Connector> fmt::Debug for PoolManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("owner", &self.owner)
            .field("pools", &self.pools.len())
            .finish()
    }
}
