//! Tenant/DAO-subnet-scoped shared state store and the isolation contract
//! enforced over it.

use std::sync::Arc;

use dashmap::DashMap;
use qflow_common::{DaoSubnetId, TenantId};
use qflow_sandbox::{SandboxError, StateAccess};

use crate::error::IsolationError;

/// The tenant/DAO-subnet pair every state operation is scoped to. Built
/// only from an already-validated `ExecutionContext`; nothing downstream
/// of this layer can construct one with a forged subnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationScope {
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
}

/// Backing store for all tenants' shared state, keyed so that no two
/// tenants — or two DAO subnets within one tenant — ever share a bucket.
#[derive(Default)]
pub struct IsolationStateStore {
    data: DashMap<(TenantId, DaoSubnetId, String), Vec<u8>>,
}

impl IsolationStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hit in `scope` returns `Ok(Some(_))`. A miss that exists under any
    /// other scope fails `IsolationViolation` rather than reporting
    /// not-found, so a cross-tenant probe can't tell a denied read from a
    /// key that was never written. A miss everywhere is `Ok(None)`.
    pub fn read(&self, scope: &IsolationScope, key: &str) -> Result<Option<Vec<u8>>, IsolationError> {
        if let Some(v) = self
            .data
            .get(&(scope.tenant_id.clone(), scope.dao_subnet_id.clone(), key.to_string()))
        {
            return Ok(Some(v.clone()));
        }
        let exists_elsewhere = self
            .data
            .iter()
            .any(|entry| entry.key().2 == key && (&entry.key().0, &entry.key().1) != (&scope.tenant_id, &scope.dao_subnet_id));
        if exists_elsewhere {
            return Err(IsolationError::IsolationViolation);
        }
        Ok(None)
    }

    pub fn write(&self, scope: &IsolationScope, key: &str, value: Vec<u8>) {
        self.data
            .insert((scope.tenant_id.clone(), scope.dao_subnet_id.clone(), key.to_string()), value);
    }
}

/// Projects one fixed `IsolationScope` onto the sandbox host's
/// [`StateAccess`] seam. The sandbox never sees a tenant id or subnet id
/// — it only sees `read_state`/`write_state` — so it has no way to name a
/// scope other than the one it was constructed with. All enforcement
/// happens here, never in the caller.
pub struct ScopedStateAccess {
    store: Arc<IsolationStateStore>,
    scope: IsolationScope,
}

impl ScopedStateAccess {
    pub fn new(store: Arc<IsolationStateStore>, scope: IsolationScope) -> Self {
        Self { store, scope }
    }
}

impl StateAccess for ScopedStateAccess {
    fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        self.store.read(&self.scope, key).map_err(|e| match e {
            IsolationError::IsolationViolation => SandboxError::IsolationViolation,
            other => SandboxError::Trap(other.to_string()),
        })
    }

    fn write_state(&self, key: &str, value: Vec<u8>) {
        self.store.write(&self.scope, key, value)
    }
}
