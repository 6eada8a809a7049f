//! The flow/execution/ledger/node/tenant data model.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::time::TimestampSeconds;
use crate::wire::{Reader, ReaderError, Serializer, Writer};

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Serializer for $name {
            fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
                Ok(Self(String::read(reader)?))
            }
            fn write(&self, writer: &mut Writer) {
                self.0.write(writer)
            }
        }
    };
}

newtype_id!(FlowId);
newtype_id!(ExecId);
newtype_id!(StepId);
newtype_id!(NodeId);
newtype_id!(TenantId);
newtype_id!(DaoSubnetId);

/// Flow priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Condition,
    Parallel,
    Loop,
    EventTrigger,
}

/// Backoff schedule for a step's retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max: u32,
    pub base_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 3,
            base_backoff_ms: 200,
            jitter_ms: 50,
        }
    }
}

/// One node of the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub kind: StepKind,
    /// Opaque action name resolved by the sandbox's action registry.
    pub action: String,
    /// Opaque structured blob, interpreted only by the sandboxed module.
    pub parameters: serde_json::Value,
    pub dependencies: HashSet<StepId>,
    pub node_preference: Option<NodeId>,
    /// Wall-clock deadline in milliseconds; default 5s, hard ceiling 60s.
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
    pub const MAX_TIMEOUT_MS: u64 = 60_000;

    /// Effective timeout after applying the default and hard ceiling.
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or(Self::DEFAULT_TIMEOUT_MS)
            .min(Self::MAX_TIMEOUT_MS)
    }
}

/// An immutable, admitted flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: FlowId,
    pub name: String,
    pub version: u32,
    pub owner: String,
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
    pub priority: Priority,
    pub steps: Vec<Step>,
}

impl Flow {
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.step_id == id)
    }
}

/// Correlates one execution to its owning identity/tenant/DAO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_id: String,
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
    pub correlation_id: String,
}

/// Execution-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

/// Step-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Blocked,
    Ready,
    Leased,
    Started,
    Completed,
    Failed,
    FatalFailed,
    Skipped,
}

impl StepStatus {
    /// Treated as terminal-success for dependency satisfaction.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::FatalFailed | StepStatus::Skipped
        )
    }
}

/// Per-step execution counters and metadata maintained by the state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    pub status_history: Vec<StepStatusEvent>,
    pub attempt: u32,
    pub current_node: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusEvent {
    pub status: StepStatus,
    pub at: TimestampSeconds,
}

impl StepState {
    /// The step's current status: the most recent entry in its history, or
    /// `Blocked` for a step that has never transitioned.
    pub fn current_status(&self) -> StepStatus {
        self.status_history
            .last()
            .map(|e| e.status)
            .unwrap_or(StepStatus::Blocked)
    }

    pub fn push_status(&mut self, status: StepStatus, at: TimestampSeconds) {
        self.status_history.push(StepStatusEvent { status, at });
    }
}

/// Per-execution run-time counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub node_failures: u64,
    pub recovered_steps: u64,
    pub partitions: u64,
}

/// One recorded failure surfaced to `get_execution_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionErrorRecord {
    pub kind: String,
    pub step_id: Option<StepId>,
    pub attempt: u32,
    pub at: TimestampSeconds,
}

/// A live execution of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub exec_id: ExecId,
    pub flow_id: FlowId,
    pub input: serde_json::Value,
    pub context: ExecutionContext,
    pub status: ExecutionStatus,
    pub step_states: HashMap<StepId, StepState>,
    pub counters: ExecutionCounters,
    pub errors: Vec<ExecutionErrorRecord>,
}

/// Ledger entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    FlowStarted,
    StepReady,
    StepLeased,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetried,
    FlowPaused,
    FlowResumed,
    FlowCompleted,
    FlowFailed,
    FlowAborted,
    NodeFailoverOccurred,
}

/// Append-only, hash-chained log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub exec_id: ExecId,
    pub seq: u64,
    pub timestamp: TimestampSeconds,
    pub kind: LedgerEntryKind,
    pub payload: serde_json::Value,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl LedgerEntry {
    /// Canonical fields hashed to produce `hash`, i.e. every field except
    /// `prev_hash` and `hash` themselves. `prev_hash` is mixed in separately
    /// by `wire::chained_hash`, not re-encoded here.
    pub fn canonical_fields(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_version();
        self.exec_id.write(&mut w);
        w.write_u64(self.seq);
        w.write_u64(self.timestamp);
        w.write_u8(self.kind.tag());
        w.write_bytes(&serde_json::to_vec(&self.payload).unwrap_or_default());
        w.into_bytes()
    }
}

// `LedgerEntryKind` needs an explicit, stable tag for canonicalization; it
// cannot rely on derive-order, since that is not part of Rust's stability
// guarantees.
impl LedgerEntryKind {
    pub fn tag(&self) -> u8 {
        match self {
            LedgerEntryKind::FlowStarted => 0,
            LedgerEntryKind::StepReady => 1,
            LedgerEntryKind::StepLeased => 2,
            LedgerEntryKind::StepStarted => 3,
            LedgerEntryKind::StepCompleted => 4,
            LedgerEntryKind::StepFailed => 5,
            LedgerEntryKind::StepRetried => 6,
            LedgerEntryKind::FlowPaused => 7,
            LedgerEntryKind::FlowResumed => 8,
            LedgerEntryKind::FlowCompleted => 9,
            LedgerEntryKind::FlowFailed => 10,
            LedgerEntryKind::FlowAborted => 11,
            LedgerEntryKind::NodeFailoverOccurred => 12,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ReaderError> {
        Ok(match tag {
            0 => LedgerEntryKind::FlowStarted,
            1 => LedgerEntryKind::StepReady,
            2 => LedgerEntryKind::StepLeased,
            3 => LedgerEntryKind::StepStarted,
            4 => LedgerEntryKind::StepCompleted,
            5 => LedgerEntryKind::StepFailed,
            6 => LedgerEntryKind::StepRetried,
            7 => LedgerEntryKind::FlowPaused,
            8 => LedgerEntryKind::FlowResumed,
            9 => LedgerEntryKind::FlowCompleted,
            10 => LedgerEntryKind::FlowFailed,
            11 => LedgerEntryKind::FlowAborted,
            12 => LedgerEntryKind::NodeFailoverOccurred,
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

/// Node health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    Offline,
}

/// A single point-in-time load sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub net_pct: f64,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub throughput: f64,
    pub error_rate: f64,
}

/// Declared node capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub supported_runtimes: Vec<String>,
    pub max_concurrent_steps: u32,
    pub max_memory_mb: u64,
    pub max_cpu_cores: u32,
}

/// A node registered in the execution pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    pub load: LoadSample,
    pub health: NodeHealth,
    pub last_updated: TimestampSeconds,
}

/// Per-tenant resource quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuotas {
    pub max_concurrent_flows: u32,
    pub max_memory_mb: u64,
    pub max_cpu_cores: u32,
    pub max_storage_gb: u64,
    pub max_network_mbps: u64,
    pub max_step_wall_time_ms: u64,
}

/// Tenant isolation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub dao_subnet_id: DaoSubnetId,
    pub allowed_resources: HashSet<String>,
    pub encryption_key_refs: Vec<String>,
    pub quotas: ResourceQuotas,
}
