//! Node scoring.

use qflow_common::config::ScoringWeights;
use qflow_common::{NodeHealth, Step};

use crate::health::NodeEntry;

/// The one runtime Qflow's sandbox host currently targets; a node must
/// declare it to be eligible at all. Nodes failing the capability match
/// are excluded.
pub const SANDBOX_RUNTIME: &str = "wasm32";

fn capability_match(entry: &NodeEntry, step: &Step) -> f64 {
    let required: Vec<String> = step
        .parameters
        .get("requires")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if required.is_empty() {
        return 1.0;
    }
    let satisfied = required
        .iter()
        .filter(|cap| entry.capabilities.supported_runtimes.iter().any(|s| s == *cap))
        .count();
    satisfied as f64 / required.len() as f64
}

/// `score = w_cpu·(1-cpu%) + w_mem·(1-mem%) + w_net·(1-net%) +
/// w_lat·(1/(1+latency)) + w_err·(1-error_rate) + w_cap·capability_match
/// − w_queue·queue_depth`. Returns `None` when the node is ineligible
/// outright (offline, missing the sandbox runtime, or a zero capability
/// match).
pub fn score_node(
    entry: &NodeEntry,
    step: &Step,
    weights: &ScoringWeights,
    byzantine_downweight: Option<f64>,
) -> Option<f64> {
    if entry.health() == NodeHealth::Offline {
        return None;
    }
    if !entry
        .capabilities
        .supported_runtimes
        .iter()
        .any(|r| r == SANDBOX_RUNTIME)
    {
        return None;
    }
    let cap = capability_match(entry, step);
    if cap <= 0.0 {
        return None;
    }

    let load = entry.load();
    let mut score = weights.cpu * (1.0 - load.cpu_pct)
        + weights.mem * (1.0 - load.mem_pct)
        + weights.net * (1.0 - load.net_pct)
        + weights.lat * (1.0 / (1.0 + load.avg_latency_ms))
        + weights.err * (1.0 - load.error_rate)
        + weights.cap * cap
        - weights.queue * load.queue_depth as f64;

    if let Some(factor) = byzantine_downweight {
        score *= factor;
    }
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qflow_common::{LoadSample, NodeCapabilities, NodeId, StepId, StepKind};
    use std::collections::HashSet;

    fn caps() -> NodeCapabilities {
        NodeCapabilities {
            supported_runtimes: vec!["wasm32".into()],
            max_concurrent_steps: 8,
            max_memory_mb: 1024,
            max_cpu_cores: 4,
        }
    }

    fn step() -> Step {
        Step {
            step_id: StepId::from("s1"),
            kind: StepKind::Action,
            action: "noop".into(),
            parameters: serde_json::json!({}),
            dependencies: HashSet::new(),
            node_preference: None,
            timeout_ms: None,
            retry_policy: None,
        }
    }

    #[test]
    fn offline_node_excluded() {
        let entry = NodeEntry::new(NodeId::from("n1"), caps(), 0);
        entry.mark_offline();
        assert!(score_node(&entry, &step(), &ScoringWeights::default(), None).is_none());
    }

    #[test]
    fn missing_runtime_excluded() {
        let entry = NodeEntry::new(
            NodeId::from("n1"),
            NodeCapabilities {
                supported_runtimes: vec!["native".into()],
                ..caps()
            },
            0,
        );
        assert!(score_node(&entry, &step(), &ScoringWeights::default(), None).is_none());
    }

    #[test]
    fn lower_load_scores_higher() {
        let idle = NodeEntry::new(NodeId::from("idle"), caps(), 0);
        let busy = NodeEntry::new(NodeId::from("busy"), caps(), 0);
        busy.record_load(
            LoadSample { cpu_pct: 0.9, mem_pct: 0.9, queue_depth: 20, ..Default::default() },
            0,
        );
        let weights = ScoringWeights::default();
        let idle_score = score_node(&idle, &step(), &weights, None).unwrap();
        let busy_score = score_node(&busy, &step(), &weights, None).unwrap();
        assert!(idle_score > busy_score);
    }
}
