//! Permission collaborator.

use async_trait::async_trait;
use dashmap::DashSet;
use qflow_common::{DaoSubnetId, TenantId};

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub identity: String,
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
    pub action: String,
    pub resource: String,
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// `true` iff `request.identity` holds `request.action` on
    /// `request.resource` inside `(request.tenant_id, request.dao_subnet_id)`.
    async fn allowed(&self, request: &PermissionRequest) -> bool;
}

fn grant_key(req: &PermissionRequest) -> String {
    format!(
        "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
        req.identity, req.tenant_id, req.dao_subnet_id, req.action, req.resource
    )
}

/// Allow-list backed permission checker. Grants are inserted out of band
/// (e.g. by an admission API); absence of a grant denies by default.
#[derive(Default)]
pub struct AllowListPermissionChecker {
    grants: DashSet<String>,
}

impl AllowListPermissionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, req: &PermissionRequest) {
        self.grants.insert(grant_key(req));
    }

    pub fn revoke(&self, req: &PermissionRequest) {
        self.grants.remove(&grant_key(req));
    }
}

#[async_trait]
impl PermissionChecker for AllowListPermissionChecker {
    async fn allowed(&self, request: &PermissionRequest) -> bool {
        self.grants.contains(&grant_key(request))
    }
}
