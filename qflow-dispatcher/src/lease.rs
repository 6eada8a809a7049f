//! Lease table: each lease carries `step_id`, `exec_id`, `node_id`,
//! `lease_ttl`, and `attempt`.

use dashmap::DashMap;
use qflow_common::time::TimestampSeconds;
use qflow_common::{ExecId, NodeId, StepId};

use crate::error::SchedulingError;

#[derive(Debug, Clone)]
pub struct Lease {
    pub exec_id: ExecId,
    pub step_id: StepId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub granted_at: TimestampSeconds,
    pub lease_ttl_ms: u64,
}

impl Lease {
    pub fn expires_at(&self) -> TimestampSeconds {
        self.granted_at + self.lease_ttl_ms / 1000
    }

    pub fn is_expired(&self, now: TimestampSeconds) -> bool {
        now > self.expires_at()
    }
}

type Key = (ExecId, StepId);

/// Every lease has exactly one holder: two `StepLeased` entries for the
/// same step must be separated by a `StepFailed` or
/// `NodeFailoverOccurred` entry, enforced here by only ever holding one
/// live `Lease` per `(exec_id, step_id)`.
#[derive(Default)]
pub struct LeaseTable {
    leases: DashMap<Key, Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(
        &self,
        exec_id: ExecId,
        step_id: StepId,
        node_id: NodeId,
        attempt: u32,
        at: TimestampSeconds,
        lease_ttl_ms: u64,
    ) -> Result<Lease, SchedulingError> {
        let key = (exec_id.clone(), step_id.clone());
        if let Some(existing) = self.leases.get(&key) {
            if !existing.is_expired(at) {
                return Err(SchedulingError::AlreadyLeased {
                    step: step_id,
                    node: existing.node_id.clone(),
                });
            }
        }
        let lease = Lease { exec_id, step_id, node_id, attempt, granted_at: at, lease_ttl_ms };
        self.leases.insert(key, lease.clone());
        Ok(lease)
    }

    pub fn release(&self, exec_id: &ExecId, step_id: &StepId) -> Option<Lease> {
        self.leases.remove(&(exec_id.clone(), step_id.clone())).map(|(_, l)| l)
    }

    pub fn get(&self, exec_id: &ExecId, step_id: &StepId) -> Option<Lease> {
        self.leases.get(&(exec_id.clone(), step_id.clone())).map(|l| l.clone())
    }

    /// Leases whose TTL has elapsed as of `now`, for the coordinator's
    /// failover sweep.
    pub fn expired(&self, now: TimestampSeconds) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every active lease held by a node, for unconditional reclaim when
    /// it goes `offline`.
    pub fn held_by(&self, node_id: &NodeId) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|entry| &entry.value().node_id == node_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_then_release_allows_regrant() {
        let table = LeaseTable::new();
        let exec = ExecId::from("e1");
        let step = StepId::from("s1");
        table.grant(exec.clone(), step.clone(), NodeId::from("n1"), 0, 0, 15_000).unwrap();
        assert!(table.grant(exec.clone(), step.clone(), NodeId::from("n2"), 0, 1, 15_000).is_err());

        table.release(&exec, &step);
        let lease = table.grant(exec.clone(), step.clone(), NodeId::from("n2"), 1, 2, 15_000).unwrap();
        assert_eq!(lease.node_id, NodeId::from("n2"));
    }

    #[test]
    fn expired_lease_can_be_regranted() {
        let table = LeaseTable::new();
        let exec = ExecId::from("e1");
        let step = StepId::from("s1");
        table.grant(exec.clone(), step.clone(), NodeId::from("n1"), 0, 0, 1_000).unwrap();
        assert!(table.expired(100).len() == 1);
        let lease = table.grant(exec.clone(), step.clone(), NodeId::from("n2"), 1, 100, 1_000).unwrap();
        assert_eq!(lease.node_id, NodeId::from("n2"));
    }

    #[test]
    fn held_by_lists_all_of_a_nodes_leases() {
        let table = LeaseTable::new();
        let exec = ExecId::from("e1");
        table.grant(exec.clone(), StepId::from("s1"), NodeId::from("n1"), 0, 0, 15_000).unwrap();
        table.grant(exec.clone(), StepId::from("s2"), NodeId::from("n1"), 0, 0, 15_000).unwrap();
        assert_eq!(table.held_by(&NodeId::from("n1")).len(), 2);
    }
}
