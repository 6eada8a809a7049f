//! Tenant-scoped registry mapping a step's `action` name to the compiled
//! module bytes to run for it. Actions resolve to a module within the
//! owning tenant's namespace only.

use dashmap::DashMap;
use qflow_common::TenantId;
use std::sync::Arc;

use crate::error::SandboxError;

#[derive(Clone)]
struct RegisteredModule {
    hash: [u8; 32],
    bytes: Arc<Vec<u8>>,
}

/// In-memory module registry. Production deployments back this with
/// content-addressed storage; the in-process map is the reference
/// implementation used by the single-node engine wiring.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: DashMap<(TenantId, String), RegisteredModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
        }
    }

    pub fn register(&self, tenant: TenantId, action: impl Into<String>, bytes: Vec<u8>) {
        let hash = qflow_common::wire::hash_bytes(&bytes);
        self.modules.insert(
            (tenant, action.into()),
            RegisteredModule {
                hash,
                bytes: Arc::new(bytes),
            },
        );
    }

    pub fn resolve(
        &self,
        tenant: &TenantId,
        action: &str,
    ) -> Result<(Arc<Vec<u8>>, [u8; 32]), SandboxError> {
        self.modules
            .get(&(tenant.clone(), action.to_string()))
            .map(|m| (m.bytes.clone(), m.hash))
            .ok_or_else(|| SandboxError::UnknownAction(action.to_string()))
    }

    pub fn deregister(&self, tenant: &TenantId, action: &str) {
        self.modules.remove(&(tenant.clone(), action.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_resolve_roundtrips() {
        let reg = ModuleRegistry::new();
        let tenant = TenantId::from("tenant-a");
        reg.register(tenant.clone(), "transform", vec![0u8, 1, 2, 3]);

        let (bytes, hash) = reg.resolve(&tenant, "transform").unwrap();
        assert_eq!(*bytes, vec![0u8, 1, 2, 3]);
        assert_eq!(hash, qflow_common::wire::hash_bytes(&[0u8, 1, 2, 3]));
    }

    #[test]
    fn unregistered_action_is_unknown() {
        let reg = ModuleRegistry::new();
        let tenant = TenantId::from("tenant-a");
        let err = reg.resolve(&tenant, "missing").unwrap_err();
        assert!(matches!(err, SandboxError::UnknownAction(_)));
    }

    #[test]
    fn tenants_are_isolated() {
        let reg = ModuleRegistry::new();
        let a = TenantId::from("tenant-a");
        let b = TenantId::from("tenant-b");
        reg.register(a.clone(), "transform", vec![9u8]);
        assert!(reg.resolve(&b, "transform").is_err());
    }
}
