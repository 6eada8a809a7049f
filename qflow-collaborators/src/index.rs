//! Index & dedup collaborator.

use async_trait::async_trait;
use dashmap::DashMap;
use qflow_common::{DaoSubnetId, TenantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index service unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// First time this fingerprint has been seen under this scope.
    New,
    /// Already indexed; pipeline should short-circuit with the cached ref.
    Duplicate { cached_ref: String },
}

#[async_trait]
pub trait IndexService: Send + Sync {
    /// Records `fingerprint` under `(tenant_id, dao_subnet_id)` if not
    /// already present, returning whether this call is the first.
    async fn check_and_record(
        &self,
        fingerprint: &[u8; 32],
        tenant_id: &TenantId,
        dao_subnet_id: &DaoSubnetId,
    ) -> Result<IndexOutcome, IndexError>;
}

/// In-memory content index. Keys never expire here; a production backend
/// would apply the same retention window executions use.
#[derive(Default)]
pub struct InMemoryIndexService {
    seen: DashMap<(TenantId, DaoSubnetId, [u8; 32]), String>,
}

impl InMemoryIndexService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexService for InMemoryIndexService {
    async fn check_and_record(
        &self,
        fingerprint: &[u8; 32],
        tenant_id: &TenantId,
        dao_subnet_id: &DaoSubnetId,
    ) -> Result<IndexOutcome, IndexError> {
        let key = (tenant_id.clone(), dao_subnet_id.clone(), *fingerprint);
        let cached_ref = hex::encode(fingerprint);
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(IndexOutcome::Duplicate {
                cached_ref: e.get().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(cached_ref);
                Ok(IndexOutcome::New)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_seen_is_new_second_is_duplicate() {
        let idx = InMemoryIndexService::new();
        let tenant = TenantId::from("tenant-a");
        let subnet = DaoSubnetId::from("subnet-1");
        let fp = [7u8; 32];

        assert_eq!(
            idx.check_and_record(&fp, &tenant, &subnet).await.unwrap(),
            IndexOutcome::New
        );
        let second = idx.check_and_record(&fp, &tenant, &subnet).await.unwrap();
        assert!(matches!(second, IndexOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn same_fingerprint_different_tenant_is_new() {
        let idx = InMemoryIndexService::new();
        let subnet = DaoSubnetId::from("subnet-1");
        let fp = [7u8; 32];

        idx.check_and_record(&fp, &TenantId::from("tenant-a"), &subnet)
            .await
            .unwrap();
        let outcome = idx
            .check_and_record(&fp, &TenantId::from("tenant-b"), &subnet)
            .await
            .unwrap();
        assert_eq!(outcome, IndexOutcome::New);
    }
}
