//! Per-execution runtime extension: materialized loop-body steps that
//! don't exist in the flow's static graph. Loops are unrolled lazily —
//! each iteration generates a synthetic step id `{loop_id}#{i}`.

use std::collections::HashMap;

use qflow_common::{Step, StepId};

#[derive(Debug, Clone, Default)]
pub struct LoopRuntime {
    pub next_index: u64,
    pub last_synthetic: Option<StepId>,
    pub terminated: bool,
}

/// Holds everything about an execution that isn't part of its persisted
/// [`qflow_common::Execution`] record: steps materialized at runtime by
/// loop unrolling, and the unrolling cursor for each active loop.
#[derive(Default)]
pub struct ExecutionRuntime {
    pub materialized: HashMap<StepId, Step>,
    pub loops: HashMap<StepId, LoopRuntime>,
    /// Set once a fatal step failure has triggered the flow's `on_failure`
    /// handler; the flow is held `Running` until that handler reaches a
    /// terminal state.
    pub compensation_pending: bool,
}

impl ExecutionRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn synthetic_step_id(loop_id: &StepId, index: u64) -> StepId {
    StepId::new(format!("{}#{}", loop_id.as_str(), index))
}
