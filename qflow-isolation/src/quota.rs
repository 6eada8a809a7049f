//! Per-tenant resource accounting. Consumption is tracked per tenant; any
//! sample exceeding a quota fails the current step's `ResourceExceeded`
//! without affecting other tenants. Atomic counters behind a `DashMap`
//! keyed by `(TenantId, DaoSubnetId)` so cross-tenant accounting never
//! shares a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use qflow_common::{DaoSubnetId, ResourceQuotas, TenantId};

use crate::error::IsolationError;
use crate::state::IsolationScope;

#[derive(Debug, Clone, Copy)]
pub enum Resource {
    ConcurrentFlows,
    MemoryMb,
    CpuCores,
    StorageGb,
    NetworkMbps,
}

impl Resource {
    fn label(&self) -> &'static str {
        match self {
            Resource::ConcurrentFlows => "concurrent_flows",
            Resource::MemoryMb => "memory_mb",
            Resource::CpuCores => "cpu_cores",
            Resource::StorageGb => "storage_gb",
            Resource::NetworkMbps => "network_mbps",
        }
    }

    fn limit(&self, quotas: &ResourceQuotas) -> u64 {
        match self {
            Resource::ConcurrentFlows => quotas.max_concurrent_flows as u64,
            Resource::MemoryMb => quotas.max_memory_mb,
            Resource::CpuCores => quotas.max_cpu_cores as u64,
            Resource::StorageGb => quotas.max_storage_gb,
            Resource::NetworkMbps => quotas.max_network_mbps,
        }
    }
}

#[derive(Default)]
struct Counters {
    concurrent_flows: AtomicU64,
    memory_mb: AtomicU64,
    cpu_cores: AtomicU64,
    storage_gb: AtomicU64,
    network_mbps: AtomicU64,
}

impl Counters {
    fn counter(&self, resource: Resource) -> &AtomicU64 {
        match resource {
            Resource::ConcurrentFlows => &self.concurrent_flows,
            Resource::MemoryMb => &self.memory_mb,
            Resource::CpuCores => &self.cpu_cores,
            Resource::StorageGb => &self.storage_gb,
            Resource::NetworkMbps => &self.network_mbps,
        }
    }
}

/// Per-`(tenant, subnet)` resource accountant. One instance is shared
/// process-wide; each tenant's counters live behind their own map entry so
/// a hot tenant never contends with a quiet one.
#[derive(Default)]
pub struct ResourceAccountant {
    counters: DashMap<(TenantId, DaoSubnetId), Counters>,
}

impl ResourceAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `amount` units of `resource` for `scope`, failing
    /// `ResourceExceeded` (without mutating state) if the reservation
    /// would exceed `quotas`.
    pub fn try_consume(
        &self,
        scope: &IsolationScope,
        resource: Resource,
        amount: u64,
        quotas: &ResourceQuotas,
    ) -> Result<(), IsolationError> {
        let entry = self
            .counters
            .entry((scope.tenant_id.clone(), scope.dao_subnet_id.clone()))
            .or_default();
        let counter = entry.counter(resource);
        let limit = resource.limit(quotas);

        let mut current = counter.load(Ordering::Acquire);
        loop {
            let next = current + amount;
            if next > limit {
                return Err(IsolationError::ResourceExceeded {
                    tenant_id: scope.tenant_id.to_string(),
                    resource: resource.label().to_string(),
                    used: next,
                    limit,
                });
            }
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self, scope: &IsolationScope, resource: Resource, amount: u64) {
        if let Some(entry) = self
            .counters
            .get(&(scope.tenant_id.clone(), scope.dao_subnet_id.clone()))
        {
            entry
                .counter(resource)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(amount))
                })
                .ok();
        }
    }
}
