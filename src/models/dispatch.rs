use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

use super::tag::TenantId;

/// Capability handler for one kind of taggable object.
///
/// The tag core never sees concrete object types; split and tenant-removal
/// sweeps only ask a handler whether an object still belongs to some tenant.
/// Kinds without tenant scope are exempt from overlap filtering.
pub trait ObjectHandler: Send + Sync {
    /// Whether an object with this id currently exists.
    fn exists(&self, object_id: &str) -> Result<bool>;

    /// Whether this kind carries per-tenant membership at all.
    fn has_tenant_scope(&self) -> bool;

    /// The tenants an object instance currently belongs to. Only called when
    /// `has_tenant_scope()` is true.
    fn tenants_of(&self, object_id: &str) -> Result<BTreeSet<TenantId>>;
}

impl<T: ObjectHandler + ?Sized> ObjectHandler for std::sync::Arc<T> {
    fn exists(&self, object_id: &str) -> Result<bool> {
        (**self).exists(object_id)
    }

    fn has_tenant_scope(&self) -> bool {
        (**self).has_tenant_scope()
    }

    fn tenants_of(&self, object_id: &str) -> Result<BTreeSet<TenantId>> {
        (**self).tenants_of(object_id)
    }
}

/// Dispatch table from object-kind discriminator to handler, populated at
/// startup.
#[derive(Default)]
pub struct KindRegistry {
    handlers: HashMap<String, Box<dyn ObjectHandler>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&mut self, kind: S, handler: Box<dyn ObjectHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn ObjectHandler> {
        self.handlers.get(kind).map(|h| h.as_ref())
    }

    /// The tenants of an object, or `None` when the kind is unregistered or
    /// has no tenant scope. `None` means "do not filter by overlap".
    pub fn object_tenants(&self, kind: &str, object_id: &str) -> Result<Option<BTreeSet<TenantId>>> {
        match self.get(kind) {
            Some(handler) if handler.has_tenant_scope() => {
                Ok(Some(handler.tenants_of(object_id)?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(BTreeSet<TenantId>);

    impl ObjectHandler for Fixed {
        fn exists(&self, _object_id: &str) -> Result<bool> {
            Ok(true)
        }
        fn has_tenant_scope(&self) -> bool {
            true
        }
        fn tenants_of(&self, _object_id: &str) -> Result<BTreeSet<TenantId>> {
            Ok(self.0.clone())
        }
    }

    struct Unscoped;

    impl ObjectHandler for Unscoped {
        fn exists(&self, _object_id: &str) -> Result<bool> {
            Ok(true)
        }
        fn has_tenant_scope(&self) -> bool {
            false
        }
        fn tenants_of(&self, _object_id: &str) -> Result<BTreeSet<TenantId>> {
            Ok(BTreeSet::new())
        }
    }

    #[test]
    fn test_object_tenants_scoped() {
        let mut kinds = KindRegistry::new();
        let tenants: BTreeSet<_> = [TenantId::new("a")].into_iter().collect();
        kinds.register("article", Box::new(Fixed(tenants.clone())));

        let got = kinds.object_tenants("article", "1").unwrap();
        assert_eq!(got, Some(tenants));
    }

    #[test]
    fn test_object_tenants_unscoped_and_unknown() {
        let mut kinds = KindRegistry::new();
        kinds.register("file", Box::new(Unscoped));

        assert_eq!(kinds.object_tenants("file", "1").unwrap(), None);
        assert_eq!(kinds.object_tenants("missing", "1").unwrap(), None);
    }
}
