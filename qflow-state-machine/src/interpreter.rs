//! Interprets a flow graph and drives it to a terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use qflow_common::time::TimestampSeconds;
use qflow_common::{
    Execution, ExecutionErrorRecord, ExecutionStatus, ExecId, Flow, LedgerEntryKind, NodeId,
    Step, StepId, StepKind, StepStatus,
};
use qflow_ledger::Ledger;

use crate::error::StateMachineError;
use crate::runtime::{synthetic_step_id, ExecutionRuntime, LoopRuntime};

/// Conventional step id for a flow's compensation handler, treated as any
/// other step once it becomes `Ready`.
pub const ON_FAILURE_STEP_ID: &str = "on_failure";

pub const DEFAULT_LOOP_ITERATION_CEILING: u64 = 1_000;

/// Error kinds whose step gets re-leased instead of failing the flow.
const RETRYABLE_KINDS: &[&str] = &["Timeout", "StorageIO", "PeerUnreachable", "LeaseExpired", "NoEligibleNode"];

pub fn is_retryable_kind(kind: &str) -> bool {
    RETRYABLE_KINDS.contains(&kind)
}

fn valid_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Blocked, Ready)
            | (Blocked, Skipped)
            | (Ready, Leased)
            | (Leased, Started)
            | (Leased, Ready) // lease expiry / node failover
            | (Started, Completed)
            | (Started, Failed)
            | (Failed, Ready)
            | (Failed, FatalFailed)
    )
}

pub struct FlowInterpreter {
    ledger: Arc<Ledger>,
    loop_iteration_ceiling: u64,
    runtimes: DashMap<ExecId, ExecutionRuntime>,
}

impl FlowInterpreter {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            loop_iteration_ceiling: DEFAULT_LOOP_ITERATION_CEILING,
            runtimes: DashMap::new(),
        }
    }

    pub fn with_loop_iteration_ceiling(mut self, ceiling: u64) -> Self {
        self.loop_iteration_ceiling = ceiling;
        self
    }

    fn runtime_for(&self, exec_id: &ExecId) -> dashmap::mapref::one::RefMut<'_, ExecId, ExecutionRuntime> {
        self.runtimes.entry(exec_id.clone()).or_insert_with(ExecutionRuntime::new)
    }

    fn resolve_step<'a>(flow: &'a Flow, runtime: &'a ExecutionRuntime, id: &StepId) -> Option<&'a Step> {
        flow.step(id).or_else(|| runtime.materialized.get(id))
    }

    /// Public counterpart of the private `resolve_step` lookup, for callers
    /// outside this crate (the dispatcher/sandbox wiring) that need a
    /// step's definition including loop-unrolled synthetic iterations,
    /// which never appear in `flow.steps` itself.
    pub fn step_definition(&self, flow: &Flow, exec_id: &ExecId, id: &StepId) -> Option<Step> {
        let runtime = self.runtime_for(exec_id);
        Self::resolve_step(flow, &runtime, id).cloned()
    }

    async fn transition(
        &self,
        exec: &mut Execution,
        step_id: &StepId,
        to: StepStatus,
        at: TimestampSeconds,
        kind: LedgerEntryKind,
        payload: serde_json::Value,
    ) -> Result<(), StateMachineError> {
        let state = exec.step_states.entry(step_id.clone()).or_default();
        let from = state.current_status();
        if !valid_transition(from, to) {
            return Err(StateMachineError::InvalidTransition {
                step: step_id.clone(),
                from,
                to,
            });
        }
        self.ledger.append(&exec.exec_id, kind, payload, at).await?;
        let state = exec.step_states.get_mut(step_id).unwrap();
        state.push_status(to, at);
        Ok(())
    }

    /// Admits the execution: writes `FlowStarted`, initializes every
    /// static step's state as `Blocked`, then resolves the initial
    /// readiness wave.
    pub async fn start_execution(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        at: TimestampSeconds,
    ) -> Result<Vec<StepId>, StateMachineError> {
        if exec.status != ExecutionStatus::Pending {
            return Err(StateMachineError::InvalidExecutionState(
                "start_execution requires Pending".into(),
            ));
        }
        self.ledger
            .append(&exec.exec_id, LedgerEntryKind::FlowStarted, serde_json::json!({}), at)
            .await?;
        exec.status = ExecutionStatus::Running;
        for step in &flow.steps {
            exec.step_states.entry(step.step_id.clone()).or_default();
        }
        self.recompute_ready(flow, exec, at).await
    }

    /// Dependency satisfaction for one step id: a loop id's dependents must
    /// wait for the whole loop to terminate, not just its header step.
    fn dependency_satisfied(exec: &Execution, runtime: &ExecutionRuntime, dep: &StepId) -> bool {
        if let Some(loop_state) = runtime.loops.get(dep) {
            return loop_state.terminated;
        }
        exec.step_states
            .get(dep)
            .map(|s| s.current_status().satisfies_dependency())
            .unwrap_or(false)
    }

    /// Scans to a fixed point, promoting every `Blocked` step whose
    /// dependencies are all satisfied to `Ready`, auto-completing `loop`
    /// headers (materializing their first iteration) and `parallel`
    /// headers (fanning out their branches) as it goes.
    async fn recompute_ready(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        at: TimestampSeconds,
    ) -> Result<Vec<StepId>, StateMachineError> {
        let mut newly_ready = Vec::new();
        loop {
            let mut progressed = false;
            let mut runtime = self.runtime_for(&exec.exec_id);
            let candidate_ids: Vec<StepId> = flow
                .steps
                .iter()
                .map(|s| s.step_id.clone())
                .chain(runtime.materialized.keys().cloned())
                .collect();

            for id in candidate_ids {
                let status = exec
                    .step_states
                    .get(&id)
                    .map(|s| s.current_status())
                    .unwrap_or(StepStatus::Blocked);
                if status != StepStatus::Blocked {
                    continue;
                }
                let step = match Self::resolve_step(flow, &runtime, &id) {
                    Some(s) => s.clone(),
                    None => continue,
                };
                let satisfied = step
                    .dependencies
                    .iter()
                    .all(|d| Self::dependency_satisfied(exec, &runtime, d));
                if !satisfied {
                    continue;
                }

                drop(runtime);
                self.transition(
                    exec,
                    &id,
                    StepStatus::Ready,
                    at,
                    LedgerEntryKind::StepReady,
                    serde_json::json!({}),
                )
                .await?;
                progressed = true;
                newly_ready.push(id.clone());

                if step.kind == StepKind::Loop {
                    self.start_loop(flow, exec, &step, at).await?;
                } else if step.kind == StepKind::Parallel {
                    self.start_parallel(flow, exec, &step, at).await?;
                }
                runtime = self.runtime_for(&exec.exec_id);
            }

            if !progressed {
                break;
            }
        }
        Ok(newly_ready)
    }

    /// A `parallel` header never gets leased out either: it self-completes
    /// immediately. Its branches are ordinary static steps declared with a
    /// dependency on it, so the surrounding `recompute_ready` scan promotes
    /// each one to `Ready` independently on its next pass, the same way any
    /// other step's dependents get promoted. The fan-in step needs no
    /// special handling: it already depends on every branch leaf, so it
    /// becomes `Ready` once they are all `Completed` or `Skipped`.
    async fn start_parallel(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        split_step: &Step,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        let branches: Vec<StepId> = flow
            .steps
            .iter()
            .filter(|s| s.dependencies.contains(&split_step.step_id))
            .map(|s| s.step_id.clone())
            .collect();

        self.transition(
            exec,
            &split_step.step_id,
            StepStatus::Leased,
            at,
            LedgerEntryKind::StepLeased,
            serde_json::json!({"synthetic": true}),
        )
        .await?;
        self.transition(
            exec,
            &split_step.step_id,
            StepStatus::Started,
            at,
            LedgerEntryKind::StepStarted,
            serde_json::json!({"synthetic": true}),
        )
        .await?;
        self.transition(
            exec,
            &split_step.step_id,
            StepStatus::Completed,
            at,
            LedgerEntryKind::StepCompleted,
            serde_json::json!({"synthetic": true, "branches": branches.iter().map(|b| b.as_str()).collect::<Vec<_>>()}),
        )
        .await?;
        Ok(())
    }

    /// A `loop` header never gets leased out: it self-completes immediately
    /// and materializes iteration 0.
    async fn start_loop(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        loop_step: &Step,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        self.transition(
            exec,
            &loop_step.step_id,
            StepStatus::Leased,
            at,
            LedgerEntryKind::StepLeased,
            serde_json::json!({"synthetic": true}),
        )
        .await?;
        self.transition(
            exec,
            &loop_step.step_id,
            StepStatus::Started,
            at,
            LedgerEntryKind::StepStarted,
            serde_json::json!({"synthetic": true}),
        )
        .await?;
        self.transition(
            exec,
            &loop_step.step_id,
            StepStatus::Completed,
            at,
            LedgerEntryKind::StepCompleted,
            serde_json::json!({"synthetic": true, "loop_start": true}),
        )
        .await?;

        let mut runtime = self.runtime_for(&exec.exec_id);
        runtime.loops.insert(loop_step.step_id.clone(), LoopRuntime::default());
        let first_id = synthetic_step_id(&loop_step.step_id, 0);
        let mut body = loop_step.clone();
        body.step_id = first_id.clone();
        body.kind = StepKind::Action;
        body.dependencies = loop_step.dependencies.clone();
        runtime.materialized.insert(first_id.clone(), body);
        let mut loop_state = runtime.loops.get_mut(&loop_step.step_id).unwrap();
        loop_state.next_index = 1;
        loop_state.last_synthetic = Some(first_id);
        let _ = flow; // kept for signature symmetry / future guard evaluation against flow-level config
        Ok(())
    }

    pub async fn lease_step(
        &self,
        exec: &mut Execution,
        step_id: &StepId,
        node_id: NodeId,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        self.transition(
            exec,
            step_id,
            StepStatus::Leased,
            at,
            LedgerEntryKind::StepLeased,
            serde_json::json!({"node_id": node_id.as_str()}),
        )
        .await?;
        exec.step_states.get_mut(step_id).unwrap().current_node = Some(node_id);
        Ok(())
    }

    pub async fn step_started(
        &self,
        exec: &mut Execution,
        step_id: &StepId,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        self.transition(
            exec,
            step_id,
            StepStatus::Started,
            at,
            LedgerEntryKind::StepStarted,
            serde_json::json!({}),
        )
        .await
    }

    /// `Started → Completed`. Handles `condition` branch skipping and
    /// `loop` iteration advancement, then resolves the next readiness wave.
    pub async fn step_completed(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        step_id: &StepId,
        result: serde_json::Value,
        at: TimestampSeconds,
    ) -> Result<Vec<StepId>, StateMachineError> {
        self.transition(
            exec,
            step_id,
            StepStatus::Completed,
            at,
            LedgerEntryKind::StepCompleted,
            result.clone(),
        )
        .await?;

        let runtime = self.runtime_for(&exec.exec_id);
        let step = Self::resolve_step(flow, &runtime, step_id).cloned();
        drop(runtime);

        if let Some(step) = &step {
            match step.kind {
                StepKind::Condition => self.apply_condition_result(flow, exec, step, &result, at).await?,
                StepKind::Action | StepKind::Parallel | StepKind::Loop | StepKind::EventTrigger => {}
            }
        }

        // If this step is an iteration of an active loop, decide whether to
        // materialize the next one.
        if let Some((loop_id, index)) = parse_synthetic_id(step_id) {
            self.advance_loop(flow, exec, &loop_id, index, &result, at).await?;
        }

        if step_id.as_str() == ON_FAILURE_STEP_ID {
            let pending = self.runtime_for(&exec.exec_id).compensation_pending;
            if pending && exec.status == ExecutionStatus::Running {
                self.finish_execution(exec, ExecutionStatus::Failed, at).await?;
                return Ok(Vec::new());
            }
        }

        self.recompute_ready(flow, exec, at).await
    }

    async fn apply_condition_result(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        condition: &Step,
        result: &serde_json::Value,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        let taken: HashSet<StepId> = result
            .get("take")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(StepId::new)
                    .collect()
            })
            .unwrap_or_default();

        let dependents: Vec<StepId> = flow
            .steps
            .iter()
            .filter(|s| s.dependencies.contains(&condition.step_id))
            .map(|s| s.step_id.clone())
            .collect();

        for dependent in dependents {
            if taken.contains(&dependent) {
                continue;
            }
            let status = exec
                .step_states
                .get(&dependent)
                .map(|s| s.current_status())
                .unwrap_or(StepStatus::Blocked);
            if status == StepStatus::Blocked {
                self.transition(
                    exec,
                    &dependent,
                    StepStatus::Skipped,
                    at,
                    LedgerEntryKind::StepCompleted,
                    serde_json::json!({"skipped_by": condition.step_id.as_str()}),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn advance_loop(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        loop_id: &StepId,
        index: u64,
        result: &serde_json::Value,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        let guard_continue = result.get("loop_continue").and_then(|v| v.as_bool()).unwrap_or(false);
        let mut runtime = self.runtime_for(&exec.exec_id);
        let Some(loop_state) = runtime.loops.get_mut(loop_id) else {
            return Ok(());
        };
        if !guard_continue {
            loop_state.terminated = true;
            return Ok(());
        }
        if index + 1 >= self.loop_iteration_ceiling {
            loop_state.terminated = true;
            drop(runtime);
            return Err(StateMachineError::LoopIterationCeilingExceeded(loop_id.clone()));
        }

        let loop_step = flow
            .step(loop_id)
            .cloned()
            .ok_or_else(|| StateMachineError::UnknownStep(loop_id.clone()))?;
        let next_id = synthetic_step_id(loop_id, index + 1);
        let prev_id = synthetic_step_id(loop_id, index);
        let mut body = loop_step.clone();
        body.step_id = next_id.clone();
        body.kind = StepKind::Action;
        body.dependencies = [prev_id].into_iter().collect();
        runtime.materialized.insert(next_id.clone(), body);
        exec.step_states.entry(next_id.clone()).or_default();
        loop_state.next_index = index + 2;
        loop_state.last_synthetic = Some(next_id);
        Ok(())
    }

    /// `Started → Failed`, then either `Failed → Ready` (retry) or
    /// `Failed → FatalFailed` (budget exhausted / non-retryable).
    pub async fn step_failed(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        step_id: &StepId,
        error_kind: &str,
        at: TimestampSeconds,
    ) -> Result<Vec<StepId>, StateMachineError> {
        self.transition(
            exec,
            step_id,
            StepStatus::Failed,
            at,
            LedgerEntryKind::StepFailed,
            serde_json::json!({"error_kind": error_kind}),
        )
        .await?;

        let runtime = self.runtime_for(&exec.exec_id);
        let step = Self::resolve_step(flow, &runtime, step_id)
            .cloned()
            .ok_or_else(|| StateMachineError::UnknownStep(step_id.clone()))?;
        drop(runtime);

        let state = exec.step_states.get_mut(step_id).unwrap();
        let attempt = state.attempt;
        let policy = step.retry_policy.clone().unwrap_or_default();

        exec.errors.push(ExecutionErrorRecord {
            kind: error_kind.to_string(),
            step_id: Some(step_id.clone()),
            attempt,
            at,
        });

        if is_retryable_kind(error_kind) && attempt < policy.max {
            exec.step_states.get_mut(step_id).unwrap().attempt += 1;
            self.transition(
                exec,
                step_id,
                StepStatus::Ready,
                at,
                LedgerEntryKind::StepRetried,
                serde_json::json!({"attempt": attempt + 1}),
            )
            .await?;
            return Ok(vec![step_id.clone()]);
        }

        self.transition(
            exec,
            step_id,
            StepStatus::FatalFailed,
            at,
            LedgerEntryKind::StepFailed,
            serde_json::json!({"fatal": true}),
        )
        .await?;
        self.propagate_fatal_failure(flow, exec, at).await
    }

    /// A fatal step failure triggers the flow's `on_failure` step (if
    /// declared) before the flow itself is marked `Failed`.
    async fn propagate_fatal_failure(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        at: TimestampSeconds,
    ) -> Result<Vec<StepId>, StateMachineError> {
        let on_failure_id = StepId::new(ON_FAILURE_STEP_ID);
        let has_handler = flow.step(&on_failure_id).is_some();
        if !has_handler {
            self.finish_execution(exec, ExecutionStatus::Failed, at).await?;
            return Ok(Vec::new());
        }

        let handler_status = exec
            .step_states
            .get(&on_failure_id)
            .map(|s| s.current_status())
            .unwrap_or(StepStatus::Blocked);

        if handler_status.is_terminal() {
            self.finish_execution(exec, ExecutionStatus::Failed, at).await?;
            return Ok(Vec::new());
        }

        if handler_status == StepStatus::Blocked {
            self.transition(
                exec,
                &on_failure_id,
                StepStatus::Ready,
                at,
                LedgerEntryKind::StepReady,
                serde_json::json!({"compensation": true}),
            )
            .await?;
            self.runtime_for(&exec.exec_id).compensation_pending = true;
            return Ok(vec![on_failure_id]);
        }

        // Handler already running; the flow stays `Running` until it
        // reaches a terminal state (checked again from `step_completed`'s
        // or `step_failed`'s next call for `on_failure` itself).
        Ok(Vec::new())
    }

    async fn finish_execution(
        &self,
        exec: &mut Execution,
        status: ExecutionStatus,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        let kind = match status {
            ExecutionStatus::Completed => LedgerEntryKind::FlowCompleted,
            ExecutionStatus::Failed => LedgerEntryKind::FlowFailed,
            ExecutionStatus::Aborted => LedgerEntryKind::FlowAborted,
            _ => {
                return Err(StateMachineError::InvalidExecutionState(
                    "finish_execution requires a terminal status".into(),
                ))
            }
        };
        self.ledger.append(&exec.exec_id, kind, serde_json::json!({}), at).await?;
        exec.status = status;
        Ok(())
    }

    /// An execution is `Completed` iff every non-skipped step has reached
    /// `StepCompleted`.
    pub fn is_flow_complete(&self, flow: &Flow, exec: &Execution) -> bool {
        let runtime = self.runtime_for(&exec.exec_id);
        flow.steps.iter().all(|s| {
            exec.step_states
                .get(&s.step_id)
                .map(|st| st.current_status())
                .map(|status| status == StepStatus::Completed || status == StepStatus::Skipped)
                .unwrap_or(false)
        }) && runtime.loops.values().all(|l| l.terminated)
    }

    pub async fn complete_execution_if_done(
        &self,
        flow: &Flow,
        exec: &mut Execution,
        at: TimestampSeconds,
    ) -> Result<bool, StateMachineError> {
        if exec.status == ExecutionStatus::Running && self.is_flow_complete(flow, exec) {
            self.finish_execution(exec, ExecutionStatus::Completed, at).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn pause_execution(&self, exec: &mut Execution, at: TimestampSeconds) -> Result<(), StateMachineError> {
        if exec.status != ExecutionStatus::Running {
            return Err(StateMachineError::InvalidExecutionState("pause requires Running".into()));
        }
        self.ledger
            .append(&exec.exec_id, LedgerEntryKind::FlowPaused, serde_json::json!({}), at)
            .await?;
        exec.status = ExecutionStatus::Paused;
        Ok(())
    }

    pub async fn resume_execution(&self, exec: &mut Execution, at: TimestampSeconds) -> Result<(), StateMachineError> {
        if exec.status != ExecutionStatus::Paused {
            return Err(StateMachineError::InvalidExecutionState("resume requires Paused".into()));
        }
        self.ledger
            .append(&exec.exec_id, LedgerEntryKind::FlowResumed, serde_json::json!({}), at)
            .await?;
        exec.status = ExecutionStatus::Running;
        Ok(())
    }

    pub async fn abort_execution(&self, exec: &mut Execution, at: TimestampSeconds) -> Result<(), StateMachineError> {
        if !matches!(exec.status, ExecutionStatus::Running | ExecutionStatus::Paused) {
            return Err(StateMachineError::InvalidExecutionState(
                "abort requires Running or Paused".into(),
            ));
        }
        self.finish_execution(exec, ExecutionStatus::Aborted, at).await
    }

    /// Lease expiry: `Leased → Ready`, preserving attempt count, ledger
    /// `NodeFailoverOccurred`.
    pub async fn node_failover(
        &self,
        exec: &mut Execution,
        step_id: &StepId,
        at: TimestampSeconds,
    ) -> Result<(), StateMachineError> {
        self.ledger
            .append(
                &exec.exec_id,
                LedgerEntryKind::NodeFailoverOccurred,
                serde_json::json!({"step_id": step_id.as_str()}),
                at,
            )
            .await?;
        let state = exec.step_states.entry(step_id.clone()).or_default();
        let from = state.current_status();
        if !valid_transition(from, StepStatus::Ready) {
            return Err(StateMachineError::InvalidTransition {
                step: step_id.clone(),
                from,
                to: StepStatus::Ready,
            });
        }
        state.push_status(StepStatus::Ready, at);
        state.current_node = None;
        exec.counters.node_failures += 1;
        Ok(())
    }
}

fn parse_synthetic_id(id: &StepId) -> Option<(StepId, u64)> {
    let s = id.as_str();
    let (loop_part, index_part) = s.rsplit_once('#')?;
    let index: u64 = index_part.parse().ok()?;
    Some((StepId::new(loop_part), index))
}
