//! Deterministic leader election: re-elected on failure by a deterministic
//! rule, the lowest `node_id` among the quorum that has seen the highest
//! `seq`. Chosen over BFT voting for its simplicity and determinism.

use qflow_common::NodeId;

/// One quorum member's self-reported progress on an execution's chain.
#[derive(Debug, Clone)]
pub struct QuorumMember {
    pub node_id: NodeId,
    pub seq: u64,
}

/// Picks the lowest `node_id` among the members that have seen the
/// highest `seq`. Returns `None` for an empty quorum.
pub fn elect_leader(members: &[QuorumMember]) -> Option<NodeId> {
    let highest_seq = members.iter().map(|m| m.seq).max()?;
    members
        .iter()
        .filter(|m| m.seq == highest_seq)
        .map(|m| &m.node_id)
        .min()
        .cloned()
}
