//! `QflowEngine`: the single-node facade wiring every component crate into
//! the node's ingress operations. One instance owns all per-node state;
//! `tasks.rs` spawns the workers that drive it.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use qflow_common::config::Config;
use qflow_common::time::now_seconds;
use qflow_common::{
    DaoSubnetId, ExecId, Execution, ExecutionContext, ExecutionCounters, ExecutionErrorRecord,
    ExecutionStatus, Flow, FlowId, LedgerEntry, NodeCapabilities, NodeId, Step, StepId, StepStatus,
    TenantContext, TenantId,
};
use qflow_dispatcher::{Dispatcher, SchedulingError};
use qflow_isolation::{IsolationScope, IsolationStateStore, Resource, ResourceAccountant};
use qflow_ledger::{Ledger, LedgerError};
use qflow_state_machine::FlowInterpreter;
use qflow_validation::{PayloadValidationRequest, ValidationOutcome, ValidationPipeline};
use tokio::sync::{mpsc, Mutex};

use qflow_validation::ValidationError;

use crate::error::QflowError;
use crate::executor::{default_caps, ActionExecutor};

/// Maps a validation-stage failure onto the error-kind strings the state
/// machine's retry policy understands. Only `IndexingUnavailable` is
/// retryable there; every other validation failure goes straight to
/// `FatalFailed`.
fn validation_error_kind(e: &ValidationError) -> &'static str {
    match e {
        ValidationError::DecryptionFailed(_) => "DecryptionFailed",
        ValidationError::PermissionDenied { .. } => "PermissionDenied",
        ValidationError::IndexingUnavailable => "IndexingUnavailable",
        ValidationError::IntegrityViolation(_) => "IntegrityViolation",
        ValidationError::SchemaViolation(_) => "SchemaViolation",
    }
}

/// One unit of dispatchable work: a step that has become `Ready` and needs
/// a lease, a sandbox invocation, and a completion recorded.
#[derive(Debug, Clone)]
pub struct StepJob {
    pub exec_id: ExecId,
    pub step_id: StepId,
}

/// Snapshot returned by `get_execution_status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionStatusView {
    pub status: ExecutionStatus,
    pub completed_steps: Vec<StepId>,
    pub running_steps: Vec<StepId>,
    pub errors: Vec<ExecutionErrorRecord>,
    pub final_state: serde_json::Value,
}

pub struct QflowEngine {
    pub ledger: Arc<Ledger>,
    pub interpreter: Arc<FlowInterpreter>,
    pub dispatcher: Arc<Dispatcher>,
    pub coordinator: Arc<qflow_coordination::Coordinator>,
    pub isolation_store: Arc<IsolationStateStore>,
    pub accountant: Arc<ResourceAccountant>,
    pub validation: Arc<ValidationPipeline>,
    pub executor: Arc<dyn ActionExecutor>,
    config: Config,
    local_node: NodeId,
    flows: DashMap<FlowId, Arc<Flow>>,
    executions: DashMap<ExecId, Arc<Mutex<Execution>>>,
    tenants: DashMap<TenantId, TenantContext>,
    /// Steps whose last transition into `Ready` came from `node_failover`
    /// rather than a fresh lease or a retry; consumed on the next
    /// successful completion to credit `ExecutionCounters::recovered_steps`
    /// (not itself tracked by the state machine).
    failovered_steps: DashSet<(ExecId, StepId)>,
    step_tx: mpsc::Sender<StepJob>,
}

impl QflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        local_node: NodeId,
        ledger: Arc<Ledger>,
        interpreter: Arc<FlowInterpreter>,
        dispatcher: Arc<Dispatcher>,
        coordinator: Arc<qflow_coordination::Coordinator>,
        isolation_store: Arc<IsolationStateStore>,
        accountant: Arc<ResourceAccountant>,
        validation: Arc<ValidationPipeline>,
        executor: Arc<dyn ActionExecutor>,
        step_tx: mpsc::Sender<StepJob>,
    ) -> Self {
        Self {
            ledger,
            interpreter,
            dispatcher,
            coordinator,
            isolation_store,
            accountant,
            validation,
            executor,
            config,
            local_node,
            flows: DashMap::new(),
            executions: DashMap::new(),
            tenants: DashMap::new(),
            failovered_steps: DashSet::new(),
            step_tx,
        }
    }

    pub fn register_tenant(&self, ctx: TenantContext) {
        self.tenants.insert(ctx.tenant_id.clone(), ctx);
    }

    pub fn register_node(&self, node_id: NodeId, capabilities: NodeCapabilities) {
        self.dispatcher.registry.register(node_id, capabilities, now_seconds());
    }

    fn tenant_cap(&self, tenant_id: &TenantId) -> u32 {
        self.tenants
            .get(tenant_id)
            .map(|t| t.quotas.max_concurrent_flows)
            .unwrap_or(u32::MAX)
    }

    /// Rejects a flow with duplicate step ids up front, since the
    /// interpreter assumes `Flow::step` finds a unique definition.
    pub async fn submit_flow(&self, flow: Flow) -> Result<FlowId, QflowError> {
        let mut seen = std::collections::HashSet::new();
        for step in &flow.steps {
            if !seen.insert(step.step_id.clone()) {
                return Err(QflowError::StateMachine(
                    qflow_state_machine::StateMachineError::InvalidExecutionState(format!(
                        "duplicate step id {}",
                        step.step_id
                    )),
                ));
            }
        }
        let flow_id = flow.flow_id.clone();
        self.flows.insert(flow_id.clone(), Arc::new(flow));
        Ok(flow_id)
    }

    /// `exec_id` is derived deterministically from `(flow_id,
    /// correlation_id)` so that a retried call within the configured
    /// `dedup_window_ms` with the same idempotency key lands on the same
    /// execution rather than admitting a duplicate. The dedup window itself
    /// is enforced by the caller-side idempotency key choice; this engine
    /// does not separately time out the mapping.
    pub async fn start_execution(
        &self,
        flow_id: &FlowId,
        input: serde_json::Value,
        context: ExecutionContext,
    ) -> Result<ExecId, QflowError> {
        let flow = self
            .flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| QflowError::UnknownFlow(flow_id.clone()))?;

        let exec_id = ExecId::new(format!("{}:{}", flow_id.as_str(), context.correlation_id));
        if self.executions.contains_key(&exec_id) {
            return Ok(exec_id);
        }

        let mut exec = Execution {
            exec_id: exec_id.clone(),
            flow_id: flow_id.clone(),
            input,
            context,
            status: ExecutionStatus::Pending,
            step_states: Default::default(),
            counters: ExecutionCounters::default(),
            errors: Vec::new(),
        };

        let at = now_seconds();
        self.coordinator.admit_as_leader(exec_id.clone(), at);
        let ready = self.interpreter.start_execution(&flow, &mut exec, at).await?;
        self.executions.insert(exec_id.clone(), Arc::new(Mutex::new(exec)));

        for step_id in ready {
            self.enqueue(exec_id.clone(), step_id).await;
        }
        Ok(exec_id)
    }

    async fn enqueue(&self, exec_id: ExecId, step_id: StepId) {
        if self.step_tx.send(StepJob { exec_id, step_id }).await.is_err() {
            log::error!("qflow: step worker channel closed, dropping job");
        }
    }

    fn exec_handle(&self, exec_id: &ExecId) -> Result<Arc<Mutex<Execution>>, QflowError> {
        self.executions
            .get(exec_id)
            .map(|e| e.clone())
            .ok_or_else(|| QflowError::UnknownExecution(exec_id.clone()))
    }

    pub async fn pause_execution(&self, exec_id: &ExecId) -> Result<(), QflowError> {
        let handle = self.exec_handle(exec_id)?;
        let mut exec = handle.lock().await;
        self.interpreter.pause_execution(&mut exec, now_seconds()).await?;
        Ok(())
    }

    pub async fn resume_execution(&self, exec_id: &ExecId) -> Result<(), QflowError> {
        let handle = self.exec_handle(exec_id)?;
        {
            let mut exec = handle.lock().await;
            self.interpreter.resume_execution(&mut exec, now_seconds()).await?;
        }
        // Resume only flips the execution-level status; any step already
        // sitting at `Ready` from before the pause needs to be handed back
        // to the worker pool explicitly.
        self.requeue_ready_steps(exec_id).await;
        Ok(())
    }

    /// After a resume, any step still sitting at `Ready` needs to be handed
    /// back to the worker pool, since a paused execution's run loop does
    /// not re-poll on its own.
    async fn requeue_ready_steps(&self, exec_id: &ExecId) {
        let Ok(handle) = self.exec_handle(exec_id) else { return };
        let exec = handle.lock().await;
        let ready: Vec<StepId> = exec
            .step_states
            .iter()
            .filter(|(_, state)| state.current_status() == StepStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        drop(exec);
        for step_id in ready {
            self.enqueue(exec_id.clone(), step_id).await;
        }
    }

    pub async fn abort_execution(&self, exec_id: &ExecId) -> Result<(), QflowError> {
        let handle = self.exec_handle(exec_id)?;
        let mut exec = handle.lock().await;
        self.interpreter.abort_execution(&mut exec, now_seconds()).await?;
        Ok(())
    }

    pub async fn get_execution_status(&self, exec_id: &ExecId) -> Result<ExecutionStatusView, QflowError> {
        let handle = self.exec_handle(exec_id)?;
        let exec = handle.lock().await;
        let completed_steps = exec
            .step_states
            .iter()
            .filter(|(_, s)| s.current_status() == StepStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        let running_steps = exec
            .step_states
            .iter()
            .filter(|(_, s)| matches!(s.current_status(), StepStatus::Leased | StepStatus::Started))
            .map(|(id, _)| id.clone())
            .collect();
        let status = exec.status;
        let errors = exec.errors.clone();
        drop(exec);

        let final_state = self.last_completed_step_result(exec_id).await;
        Ok(ExecutionStatusView {
            status,
            completed_steps,
            running_steps,
            errors,
            final_state,
        })
    }

    /// The output payload of whichever step most recently reached
    /// `StepCompleted`, read back from the ledger rather than kept on
    /// `Execution` itself. `Null` if nothing has completed yet.
    async fn last_completed_step_result(&self, exec_id: &ExecId) -> serde_json::Value {
        let Ok(entries) = self.get_execution_ledger(exec_id, None, None).await else {
            return serde_json::Value::Null;
        };
        entries
            .iter()
            .rev()
            .find(|e| e.kind == qflow_common::LedgerEntryKind::StepCompleted)
            .map(|e| e.payload.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    pub async fn get_execution_ledger(
        &self,
        exec_id: &ExecId,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<LedgerEntry>, QflowError> {
        let from = from_seq.unwrap_or(0);
        let to = match to_seq {
            Some(t) => t,
            None => self.ledger.head(exec_id).await?.0 + 1,
        };
        Ok(self.ledger.read(exec_id, from, to).await?)
    }

    /// Recomputes the whole chain for `exec_id`; on tamper, flips the
    /// in-memory execution to `Failed` so no further leases are granted and
    /// `get_execution_status` reports it, then propagates the error.
    pub async fn verify_ledger(&self, exec_id: &ExecId) -> Result<bool, QflowError> {
        match self.ledger.verify(exec_id).await {
            Ok(ok) => Ok(ok),
            Err(err @ LedgerError::IntegrityViolation { .. }) => {
                if let Some(handle) = self.executions.get(exec_id) {
                    let mut exec = handle.lock().await;
                    exec.status = ExecutionStatus::Failed;
                    exec.errors.push(ExecutionErrorRecord {
                        kind: "IntegrityViolation".to_string(),
                        step_id: None,
                        attempt: 0,
                        at: now_seconds(),
                    });
                }
                Err(err.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every lease held by `node_id` is reclaimed and its step put back to
    /// `Ready` via `node_failover`, then redispatched.
    pub async fn handle_node_offline(&self, node_id: &NodeId) {
        let leases = self.dispatcher.reclaim_offline_node(node_id);
        for lease in leases {
            let Ok(handle) = self.exec_handle(&lease.exec_id) else { continue };
            let mut exec = handle.lock().await;
            if self
                .interpreter
                .node_failover(&mut exec, &lease.step_id, now_seconds())
                .await
                .is_ok()
            {
                self.failovered_steps.insert((lease.exec_id.clone(), lease.step_id.clone()));
                drop(exec);
                self.enqueue(lease.exec_id, lease.step_id).await;
            }
        }
    }

    /// Heartbeat sweep: mark every node that missed this interval, and
    /// reclaim whatever went `Offline` as a result. Returns the ids newly
    /// marked offline, for the caller's logging.
    pub async fn sweep_heartbeats(&self, missed_threshold: u32) -> Vec<NodeId> {
        let mut offline = Vec::new();
        for node_id in self.dispatcher.registry.snapshot_all() {
            self.dispatcher.registry.note_missed_heartbeat(&node_id.node_id, missed_threshold);
            if let Some(record) = self.dispatcher.registry.snapshot(&node_id.node_id) {
                if record.health == qflow_common::NodeHealth::Offline {
                    offline.push(node_id.node_id.clone());
                }
            }
        }
        for node_id in &offline {
            self.handle_node_offline(node_id).await;
        }
        offline
    }

    /// Runs one step end to end: lease, validate, invoke, record. Called by
    /// a worker in the sandbox worker pool. Failures that can't be
    /// attributed to the step itself (unknown execution/flow, execution not
    /// running) are logged and dropped rather than panicking a worker.
    pub async fn run_step(&self, job: StepJob) {
        let StepJob { exec_id, step_id } = job;
        let Ok(handle) = self.exec_handle(&exec_id) else { return };

        let Some(flow) = ({
            let exec = handle.lock().await;
            self.flows.get(&exec.flow_id).map(|f| f.clone())
        }) else {
            return;
        };

        let Some(step) = self.interpreter.step_definition(&flow, &exec_id, &step_id) else {
            return;
        };

        let (tenant_id, dao_subnet_id, attempt) = {
            let mut exec = handle.lock().await;
            if exec.status != ExecutionStatus::Running {
                return;
            }
            let status = exec
                .step_states
                .get(&step_id)
                .map(|s| s.current_status())
                .unwrap_or(StepStatus::Blocked);
            if status != StepStatus::Ready {
                return;
            }

            let tenant_id = exec.context.tenant_id.clone();
            let dao_subnet_id = exec.context.dao_subnet_id.clone();
            let attempt = exec
                .step_states
                .get(&step_id)
                .map(|s| s.attempt)
                .unwrap_or(0);
            let tenant_cap = self.tenant_cap(&tenant_id);

            let lease = match self.dispatcher.select_and_lease(
                exec_id.clone(),
                &step,
                tenant_id.clone(),
                tenant_cap,
                attempt,
                now_seconds(),
                self.config.lease_ttl_ms,
                false,
            ) {
                Ok(lease) => lease,
                Err(SchedulingError::NoEligibleNode(_)) => {
                    // No capacity right now; the step stays `Ready` and will
                    // be retried on the next heartbeat-driven redispatch.
                    return;
                }
                Err(e) => {
                    log::warn!("qflow: lease error for {}/{}: {}", exec_id, step_id, e);
                    return;
                }
            };

            if self
                .interpreter
                .lease_step(&mut exec, &step_id, lease.node_id.clone(), now_seconds())
                .await
                .is_err()
            {
                self.dispatcher.release_lease(&exec_id, &step_id, &tenant_id);
                return;
            }
            if self
                .interpreter
                .step_started(&mut exec, &step_id, now_seconds())
                .await
                .is_err()
            {
                self.dispatcher.release_lease(&exec_id, &step_id, &tenant_id);
                return;
            }
            let _ = lease.node_id;
            (tenant_id, dao_subnet_id, attempt)
        };

        let outcome = self
            .execute_step(&exec_id, &tenant_id, &dao_subnet_id, &step, &handle)
            .await;

        self.dispatcher.release_lease(&exec_id, &step_id, &tenant_id);

        let next_ready = {
            let mut exec = handle.lock().await;
            let result = match outcome {
                Ok(result) => self.interpreter.step_completed(&flow, &mut exec, &step_id, result, now_seconds()).await,
                Err(kind) => self.interpreter.step_failed(&flow, &mut exec, &step_id, &kind, now_seconds()).await,
            };
            match result {
                Ok(ready) => {
                    if self.failovered_steps.remove(&(exec_id.clone(), step_id.clone())).is_some() {
                        exec.counters.recovered_steps += 1;
                    }
                    self.interpreter
                        .complete_execution_if_done(&flow, &mut exec, now_seconds())
                        .await
                        .ok();
                    ready
                }
                Err(e) => {
                    log::error!("qflow: state transition error for {}/{}: {}", exec_id, step_id, e);
                    Vec::new()
                }
            }
        };

        for id in next_ready {
            self.enqueue(exec_id.clone(), id).await;
        }
    }

    /// Validates the step's payload then invokes its action, returning the
    /// raw JSON result the interpreter should record, or the error kind
    /// string used for the retry/fatal decision.
    async fn execute_step(
        &self,
        exec_id: &ExecId,
        tenant_id: &TenantId,
        dao_subnet_id: &DaoSubnetId,
        step: &Step,
        handle: &Arc<Mutex<Execution>>,
    ) -> Result<serde_json::Value, String> {
        let (input, identity) = {
            let exec = handle.lock().await;
            let input = serde_json::json!({"step": step.step_id.as_str(), "parameters": step.parameters, "input": exec.input});
            (input, exec.context.user_id.clone())
        };

        let request = PayloadValidationRequest {
            identity,
            tenant_id: tenant_id.clone(),
            dao_subnet_id: dao_subnet_id.clone(),
            action: step.action.clone(),
            resource: format!("action:{}", step.action),
            payload: serde_json::to_vec(&input).unwrap_or_default(),
            key_ref: None,
            signer: None,
            signature: None,
        };

        let ValidationOutcome { plaintext, .. } = self
            .validation
            .validate(&request)
            .await
            .map_err(|e| validation_error_kind(&e).to_string())?;

        let scope = IsolationScope {
            tenant_id: tenant_id.clone(),
            dao_subnet_id: dao_subnet_id.clone(),
        };
        if let Some(quotas) = self.tenants.get(tenant_id).map(|t| t.quotas.clone()) {
            self.accountant
                .try_consume(&scope, Resource::CpuCores, 1, &quotas)
                .map_err(|_| "ResourceExceeded".to_string())?;
        }

        let state = Arc::new(qflow_isolation::ScopedStateAccess::new(self.isolation_store.clone(), scope.clone()));
        let caps = default_caps(
            std::time::Duration::from_millis(step.effective_timeout_ms()),
            self.config.sandbox_memory_ceiling_mb,
            self.config.fuel_ceiling,
        );

        let result = self
            .executor
            .execute(tenant_id, &step.action, plaintext, caps, state)
            .await;

        if let Some(quotas) = self.tenants.get(tenant_id).map(|t| t.quotas.clone()) {
            self.accountant.release(&scope, Resource::CpuCores, 1);
            let _ = quotas;
        }

        match result {
            Ok(sandbox_result) => {
                serde_json::from_slice::<serde_json::Value>(&sandbox_result.output)
                    .map_err(|_| "BadResult".to_string())
            }
            Err(e) => Err(e.kind().to_string()),
        }
    }
}
