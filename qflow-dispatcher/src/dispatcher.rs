//! Node registry, selection, and lease issuance.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use qflow_common::config::{AutoscaleThresholds, ScoringWeights};
use qflow_common::time::TimestampSeconds;
use qflow_common::{ExecId, LoadSample, NodeCapabilities, NodeId, NodeRecord, Step, StepId, TenantId};

use crate::error::SchedulingError;
use crate::health::NodeEntry;
use crate::lease::{Lease, LeaseTable};
use crate::scoring::score_node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscaleSignal {
    ScaleUp,
    ScaleDown,
    Steady,
}

/// Node arena, shared between dispatcher and coordinator: records keyed by
/// `node_id`, updated through a single-writer task, with readers getting
/// snapshots.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Arc<NodeEntry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, capabilities: NodeCapabilities, at: TimestampSeconds) {
        self.nodes
            .insert(node_id.clone(), Arc::new(NodeEntry::new(node_id, capabilities, at)));
    }

    pub fn deregister(&self, node_id: &NodeId) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    pub fn record_load(&self, node_id: &NodeId, sample: LoadSample, at: TimestampSeconds) -> bool {
        match self.nodes.get(node_id) {
            Some(entry) => {
                entry.record_load(sample, at);
                true
            }
            None => false,
        }
    }

    /// Called by the coordinator's heartbeat sweep for every node that did
    /// not check in this interval.
    pub fn note_missed_heartbeat(&self, node_id: &NodeId, missed_threshold: u32) {
        if let Some(entry) = self.nodes.get(node_id) {
            entry.note_missed_heartbeat(missed_threshold);
        }
    }

    pub fn snapshot(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|e| e.snapshot())
    }

    pub fn snapshot_all(&self) -> Vec<NodeRecord> {
        self.nodes.iter().map(|e| e.snapshot()).collect()
    }

    pub(crate) fn entry(&self, node_id: &NodeId) -> Option<Arc<NodeEntry>> {
        self.nodes.get(node_id).map(|e| e.clone())
    }

    pub(crate) fn all_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }
}

pub struct Dispatcher {
    pub registry: NodeRegistry,
    pub leases: LeaseTable,
    weights: ScoringWeights,
    autoscale: AutoscaleThresholds,
    tenant_active: DashMap<TenantId, AtomicU32>,
}

impl Dispatcher {
    pub fn new(weights: ScoringWeights, autoscale: AutoscaleThresholds) -> Self {
        Self {
            registry: NodeRegistry::new(),
            leases: LeaseTable::new(),
            weights,
            autoscale,
            tenant_active: DashMap::new(),
        }
    }

    /// Picks the highest-scoring healthy node whose remaining quota admits
    /// the step: a node already holding as many leases as its declared
    /// `max_concurrent_steps` is skipped regardless of score. Ties broken
    /// by lowest `node_id`. `node_preference` breaks ties among
    /// equally-scored candidates; it is not a hard constraint unless
    /// `pin_to_preference` is set.
    pub fn select_node(&self, step: &Step, pin_to_preference: bool) -> Option<NodeId> {
        if pin_to_preference {
            if let Some(pref) = &step.node_preference {
                return self.entry(pref).is_some().then(|| pref.clone());
            }
        }

        let mut best: Option<(f64, NodeId)> = None;
        for node_id in self.registry.all_ids() {
            let Some(entry) = self.entry(&node_id) else { continue };
            if self.leases.held_by(&node_id).len() as u32 >= entry.capabilities.max_concurrent_steps {
                continue;
            }
            let Some(score) = score_node(&entry, step, &self.weights, None) else { continue };
            let preferred = step.node_preference.as_ref() == Some(&node_id);
            let candidate = (score, node_id.clone());
            best = Some(match &best {
                None => candidate,
                Some((best_score, best_id)) => {
                    if score > *best_score
                        || (score == *best_score && preferred)
                        || (score == *best_score && node_id < *best_id)
                    {
                        candidate
                    } else {
                        (*best_score, best_id.clone())
                    }
                }
            });
        }
        best.map(|(_, id)| id)
    }

    fn entry(&self, node_id: &NodeId) -> Option<Arc<NodeEntry>> {
        self.registry.entry(node_id)
    }

    /// A tenant under its concurrency cap must not be starved while
    /// eligible nodes have capacity. `tenant_cap` is supplied by the caller
    /// (the isolation layer's quota for this tenant), keeping this crate
    /// free of a direct `qflow-isolation` dependency.
    pub fn select_and_lease(
        &self,
        exec_id: ExecId,
        step: &Step,
        tenant_id: TenantId,
        tenant_cap: u32,
        attempt: u32,
        at: TimestampSeconds,
        lease_ttl_ms: u64,
        pin_to_preference: bool,
    ) -> Result<Lease, SchedulingError> {
        let active = self
            .tenant_active
            .entry(tenant_id.clone())
            .or_insert_with(|| AtomicU32::new(0));
        if active.load(Ordering::Acquire) >= tenant_cap {
            return Err(SchedulingError::NoEligibleNode(step.step_id.clone()));
        }
        drop(active);

        let node_id = self
            .select_node(step, pin_to_preference)
            .ok_or_else(|| SchedulingError::NoEligibleNode(step.step_id.clone()))?;

        let lease = self.leases.grant(exec_id, step.step_id.clone(), node_id, attempt, at, lease_ttl_ms)?;
        self.tenant_active
            .entry(tenant_id)
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::AcqRel);
        Ok(lease)
    }

    pub fn release_lease(&self, exec_id: &ExecId, step_id: &StepId, tenant_id: &TenantId) -> Option<Lease> {
        let released = self.leases.release(exec_id, step_id);
        if released.is_some() {
            if let Some(counter) = self.tenant_active.get(tenant_id) {
                counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
            }
        }
        released
    }

    /// Unconditional reclaim of every lease held by an `offline` node.
    pub fn reclaim_offline_node(&self, node_id: &NodeId) -> Vec<Lease> {
        if let Some(entry) = self.entry(node_id) {
            entry.mark_offline();
        }
        let held = self.leases.held_by(node_id);
        for lease in &held {
            self.leases.release(&lease.exec_id, &lease.step_id);
        }
        held
    }

    /// Fleet-wide average CPU utilization compared against the configured
    /// autoscale thresholds.
    pub fn autoscale_signal(&self) -> AutoscaleSignal {
        let records = self.registry.snapshot_all();
        if records.is_empty() {
            return AutoscaleSignal::Steady;
        }
        let healthy: Vec<_> = records
            .iter()
            .filter(|r| r.health == qflow_common::NodeHealth::Healthy)
            .collect();
        if healthy.is_empty() {
            return AutoscaleSignal::ScaleUp;
        }
        let avg_cpu: f64 = healthy.iter().map(|r| r.load.cpu_pct).sum::<f64>() / healthy.len() as f64;
        let headroom = 1.0 - avg_cpu;
        if headroom < self.autoscale.up {
            AutoscaleSignal::ScaleUp
        } else if headroom > 1.0 - self.autoscale.down {
            AutoscaleSignal::ScaleDown
        } else {
            AutoscaleSignal::Steady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qflow_common::StepKind;
    use std::collections::HashSet;

    fn caps() -> NodeCapabilities {
        NodeCapabilities {
            supported_runtimes: vec!["wasm32".into()],
            max_concurrent_steps: 8,
            max_memory_mb: 1024,
            max_cpu_cores: 4,
        }
    }

    fn step(id: &str) -> Step {
        Step {
            step_id: StepId::from(id),
            kind: StepKind::Action,
            action: "noop".into(),
            parameters: serde_json::json!({}),
            dependencies: HashSet::new(),
            node_preference: None,
            timeout_ms: None,
            retry_policy: None,
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ScoringWeights::default(), AutoscaleThresholds::default())
    }

    #[test]
    fn selects_the_only_eligible_node() {
        let d = dispatcher();
        d.registry.register(NodeId::from("n1"), caps(), 0);
        assert_eq!(d.select_node(&step("s1"), false), Some(NodeId::from("n1")));
    }

    #[test]
    fn ties_break_on_lowest_node_id() {
        let d = dispatcher();
        d.registry.register(NodeId::from("b"), caps(), 0);
        d.registry.register(NodeId::from("a"), caps(), 0);
        assert_eq!(d.select_node(&step("s1"), false), Some(NodeId::from("a")));
    }

    #[test]
    fn tenant_at_cap_is_refused_even_with_capacity() {
        let d = dispatcher();
        d.registry.register(NodeId::from("n1"), caps(), 0);
        let tenant = TenantId::from("t1");
        d.select_and_lease(ExecId::from("e1"), &step("s1"), tenant.clone(), 1, 0, 0, 15_000, false)
            .unwrap();
        let err = d
            .select_and_lease(ExecId::from("e1"), &step("s2"), tenant, 1, 0, 0, 15_000, false)
            .unwrap_err();
        assert!(matches!(err, SchedulingError::NoEligibleNode(_)));
    }

    #[test]
    fn releasing_a_lease_frees_tenant_capacity() {
        let d = dispatcher();
        d.registry.register(NodeId::from("n1"), caps(), 0);
        let tenant = TenantId::from("t1");
        d.select_and_lease(ExecId::from("e1"), &step("s1"), tenant.clone(), 1, 0, 0, 15_000, false)
            .unwrap();
        d.release_lease(&ExecId::from("e1"), &StepId::from("s1"), &tenant);
        d.select_and_lease(ExecId::from("e1"), &step("s2"), tenant, 1, 0, 1, 15_000, false)
            .unwrap();
    }

    #[test]
    fn offline_node_leases_are_reclaimed() {
        let d = dispatcher();
        d.registry.register(NodeId::from("n1"), caps(), 0);
        let tenant = TenantId::from("t1");
        d.select_and_lease(ExecId::from("e1"), &step("s1"), tenant, 1, 0, 0, 15_000, false)
            .unwrap();
        let reclaimed = d.reclaim_offline_node(&NodeId::from("n1"));
        assert_eq!(reclaimed.len(), 1);
        assert!(d.select_node(&step("s2"), false).is_none());
    }

    #[test]
    fn node_at_concurrency_cap_is_skipped_even_if_highest_scoring() {
        let d = dispatcher();
        let mut capped = caps();
        capped.max_concurrent_steps = 1;
        d.registry.register(NodeId::from("n1"), capped, 0);
        d.registry.register(NodeId::from("n2"), caps(), 0);
        let tenant = TenantId::from("t1");
        d.select_and_lease(ExecId::from("e1"), &step("s1"), tenant.clone(), u32::MAX, 0, 0, 15_000, false)
            .unwrap();
        // n1 got the first lease (tie broken by lowest node_id); it's now
        // at its cap, so the next selection must fall through to n2.
        assert_eq!(
            d.select_and_lease(ExecId::from("e1"), &step("s2"), tenant, u32::MAX, 0, 0, 15_000, false)
                .unwrap()
                .node_id,
            NodeId::from("n2")
        );
    }
}
