//! Per-execution leadership, partition detection, and Byzantine
//! chain-hash verification.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use qflow_common::time::TimestampSeconds;
use qflow_common::wire::chained_hash;
use qflow_common::{ExecId, LedgerEntry, NodeId};
use qflow_collaborators::peer::{PeerMessage, PeerTransport};

use crate::error::CoordinationError;
use crate::leader::{elect_leader, QuorumMember};

#[derive(Debug, Clone)]
pub struct LeaderState {
    pub leader: NodeId,
    pub epoch: u64,
}

/// One node's view of every execution it is tracking: who leads each one,
/// when a leader was last heard from, and which peers have been flagged
/// for sending chain-invalid entries.
pub struct Coordinator {
    local_node: NodeId,
    leaders: DashMap<ExecId, LeaderState>,
    last_leader_contact: DashMap<ExecId, TimestampSeconds>,
    downweighted_peers: DashSet<NodeId>,
    transport: Arc<dyn PeerTransport>,
}

impl Coordinator {
    pub fn new(local_node: NodeId, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            local_node,
            leaders: DashMap::new(),
            last_leader_contact: DashMap::new(),
            downweighted_peers: DashSet::new(),
            transport,
        }
    }

    /// The admitter is the leader by default. Called once when an
    /// execution is admitted by this node.
    pub fn admit_as_leader(&self, exec_id: ExecId, at: TimestampSeconds) {
        self.leaders.insert(exec_id.clone(), LeaderState { leader: self.local_node.clone(), epoch: 0 });
        self.last_leader_contact.insert(exec_id, at);
    }

    pub fn leader_of(&self, exec_id: &ExecId) -> Option<NodeId> {
        self.leaders.get(exec_id).map(|s| s.leader.clone())
    }

    pub fn is_leader(&self, exec_id: &ExecId) -> bool {
        self.leader_of(exec_id).as_ref() == Some(&self.local_node)
    }

    pub fn require_leader(&self, exec_id: &ExecId) -> Result<(), CoordinationError> {
        if self.is_leader(exec_id) {
            Ok(())
        } else {
            Err(CoordinationError::NotLeader(exec_id.clone()))
        }
    }

    /// A follower calls this on every ledger delta or heartbeat it
    /// receives from the current leader.
    pub fn note_leader_contact(&self, exec_id: ExecId, at: TimestampSeconds) {
        self.last_leader_contact.insert(exec_id, at);
    }

    /// A node that cannot reach the leader for `partition_threshold`
    /// ceases issuing new leases for that execution.
    pub fn check_partition(
        &self,
        exec_id: &ExecId,
        now: TimestampSeconds,
        partition_threshold_secs: u64,
    ) -> bool {
        if self.is_leader(exec_id) {
            return false;
        }
        match self.last_leader_contact.get(exec_id) {
            Some(last) => now.saturating_sub(*last) > partition_threshold_secs,
            None => true,
        }
    }

    /// Re-runs the deterministic rule over the reporting quorum and
    /// records the result with a bumped epoch, so a leader is re-elected
    /// on failure.
    pub fn elect(&self, exec_id: ExecId, members: &[QuorumMember], at: TimestampSeconds) -> Option<NodeId> {
        let leader = elect_leader(members)?;
        let epoch = self.leaders.get(&exec_id).map(|s| s.epoch + 1).unwrap_or(0);
        self.leaders.insert(exec_id.clone(), LeaderState { leader: leader.clone(), epoch });
        self.last_leader_contact.insert(exec_id, at);
        Some(leader)
    }

    /// Followers verify every received entry's chain hash and signer;
    /// invalid entries are dropped and the source is down-weighted in the
    /// dispatcher score.
    pub fn verify_entry(&self, entry: &LedgerEntry) -> bool {
        chained_hash(&entry.prev_hash, &entry.canonical_fields()) == entry.hash
    }

    pub fn flag_byzantine(&self, node_id: NodeId) {
        self.downweighted_peers.insert(node_id);
    }

    pub fn is_downweighted(&self, node_id: &NodeId) -> bool {
        self.downweighted_peers.contains(node_id)
    }

    pub async fn publish_ledger_head(&self, exec_id: &ExecId, seq: u64, hash: [u8; 32]) {
        let payload = serde_json::json!({"exec_id": exec_id.as_str(), "seq": seq, "hash": hex::encode(hash)});
        self.transport
            .publish("ledger-head", serde_json::to_vec(&payload).unwrap_or_default())
            .await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PeerMessage> {
        self.transport.subscribe()
    }
}
