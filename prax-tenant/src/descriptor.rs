//! Connection owners and tenant-qualified descriptors.
//!
//! A [`ConnectionOwner`] is whatever the application uses as a connection
//! handle (usually the primary model base). A [`ConnectionDescriptor`] pairs an
//! owner with a tenant and is the name pools are registered under:
//! `"primary[acme]"`.
//!
//! Naming replaces rather than stacks: wrapping a descriptor for another
//! tenant yields `"primary[widgets]"`, never `"primary[acme][widgets]"`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::context::TenantId;

/// What the tenancy layer needs from a connection owner.
pub trait ConnectionOwner: Send + Sync + fmt::Debug {
    /// Full name of the owner.
    fn name(&self) -> &str;

    /// Name without any tenant qualification.
    fn base_name(&self) -> &str {
        self.name()
    }

    /// Whether this owner is the application's primary connection.
    fn is_primary(&self) -> bool {
        false
    }

    /// A tenant this owner is always bound to, regardless of context.
    fn pinned_tenant(&self) -> Option<&TenantId> {
        None
    }
}

/// A plain named owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedOwner {
    name: String,
    primary: bool,
    pinned: Option<TenantId>,
}

impl NamedOwner {
    /// Create a secondary owner.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: false,
            pinned: None,
        }
    }

    /// Create the primary owner.
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            primary: true,
            ..Self::new(name)
        }
    }

    /// Bind the owner to a single tenant.
    ///
    /// Used for excluded models that always live in one partition.
    pub fn pinned_to(mut self, tenant: impl Into<TenantId>) -> Self {
        self.pinned = Some(tenant.into());
        self
    }
}

impl ConnectionOwner for NamedOwner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn pinned_tenant(&self) -> Option<&TenantId> {
        self.pinned.as_ref()
    }
}

/// Build the qualified name for an owner base name and a tenant.
pub fn qualified_name(base: &str, tenant: &TenantId) -> String {
    if tenant.is_empty() {
        base.to_string()
    } else {
        format!("{base}[{tenant}]")
    }
}

fn strip_tenant_suffix<'a>(name: &'a str, tenant: &TenantId) -> &'a str {
    if tenant.is_empty() {
        return name;
    }
    name.strip_suffix(']')
        .and_then(|rest| rest.strip_suffix(tenant.as_str()))
        .and_then(|rest| rest.strip_suffix('['))
        .unwrap_or(name)
}

/// An owner qualified by a tenant.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    owner: Arc<dyn ConnectionOwner>,
    base: Arc<str>,
    tenant: TenantId,
    name: Arc<str>,
}

impl ConnectionDescriptor {
    /// Wrap `owner` for `tenant`.
    pub fn new(owner: Arc<dyn ConnectionOwner>, tenant: impl Into<TenantId>) -> Self {
        let tenant = tenant.into();
        let base = strip_tenant_suffix(owner.base_name(), &tenant);
        let name = qualified_name(base, &tenant);
        Self {
            base: Arc::from(base),
            name: Arc::from(name),
            owner,
            tenant,
        }
    }

    /// Qualified name, e.g. `primary[acme]`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tenant.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Owner name without the tenant qualification.
    pub fn base_name(&self) -> &str {
        &self.base
    }

    /// The wrapped owner.
    pub fn owner(&self) -> &Arc<dyn ConnectionOwner> {
        &self.owner
    }
}

impl ConnectionOwner for ConnectionDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_name(&self) -> &str {
        &self.base
    }

    fn is_primary(&self) -> bool {
        self.owner.is_primary()
    }

    fn pinned_tenant(&self) -> Option<&TenantId> {
        self.owner.pinned_tenant()
    }
}

impl PartialEq for ConnectionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.tenant == other.tenant
    }
}

impl Eq for ConnectionDescriptor {}

impl Hash for ConnectionDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        self.tenant.hash(state);
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("name", &self.name)
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn primary() -> Arc<dyn ConnectionOwner> {
        Arc::new(NamedOwner::primary("primary"))
    }

    #[test]
    fn test_naming() {
        let acme = ConnectionDescriptor::new(primary(), "acme");
        assert_eq!(acme.name(), "primary[acme]");
        assert_eq!(acme.base_name(), "primary");
        assert!(acme.is_primary());

        let bare = ConnectionDescriptor::new(primary(), "");
        assert_eq!(bare.name(), "primary");
    }

    #[test]
    fn test_rewrapping_replaces_suffix() {
        let acme: Arc<dyn ConnectionOwner> = Arc::new(ConnectionDescriptor::new(primary(), "acme"));

        let again = ConnectionDescriptor::new(acme.clone(), "acme");
        assert_eq!(again.name(), "primary[acme]");

        let widgets = ConnectionDescriptor::new(acme, "widgets");
        assert_eq!(widgets.name(), "primary[widgets]");
    }

    #[test]
    fn test_already_suffixed_owner_is_not_doubled() {
        let owner: Arc<dyn ConnectionOwner> = Arc::new(NamedOwner::new("Reports[acme]"));
        let descriptor = ConnectionDescriptor::new(owner, "acme");
        assert_eq!(descriptor.name(), "Reports[acme]");
        assert_eq!(descriptor.base_name(), "Reports");
    }

    #[test]
    fn test_hash_key() {
        let mut set = HashSet::new();
        set.insert(ConnectionDescriptor::new(primary(), "acme"));
        set.insert(ConnectionDescriptor::new(primary(), "acme"));
        set.insert(ConnectionDescriptor::new(primary(), "widgets"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_pinned_tenant_delegates() {
        let owner: Arc<dyn ConnectionOwner> = Arc::new(NamedOwner::new("Country").pinned_to("public"));
        let descriptor = ConnectionDescriptor::new(owner, "acme");
        assert_eq!(descriptor.pinned_tenant().map(TenantId::as_str), Some("public"));
        assert!(!descriptor.is_primary());
    }

    proptest! {
        #[test]
        fn prop_wrapping_is_idempotent(owner in "[A-Za-z]{1,12}", tenants in prop::collection::vec("\\PC{1,16}", 1..5)) {
            let mut current: Arc<dyn ConnectionOwner> = Arc::new(NamedOwner::new(owner.clone()));
            for tenant in &tenants {
                let descriptor = ConnectionDescriptor::new(current, tenant.as_str());
                prop_assert_eq!(descriptor.name(), format!("{owner}[{tenant}]"));
                current = Arc::new(descriptor);
            }
        }
    }
}
