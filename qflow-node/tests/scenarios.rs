//! End-to-end tests driving the full `QflowEngine` stack through a real
//! (in-memory) ledger, dispatcher, validation pipeline, and isolation
//! store. No `.wasm` fixtures exist in this tree, so every action here
//! runs through `ScriptedActionExecutor` rather than the real sandbox host.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use qflow_collaborators::{
    AllowListPermissionChecker, HashDerivedEncryptionService, InMemoryIndexService,
    InProcessPeerTransport, PermissionRequest, SharedSecretSignatureVerifier,
};
use qflow_common::config::Config;
use qflow_common::{
    DaoSubnetId, ExecId, ExecutionContext, Flow, FlowId, LedgerEntryKind, NodeCapabilities, NodeId,
    Priority, ResourceQuotas, Step, StepId, StepKind, TenantContext, TenantId,
};
use qflow_coordination::Coordinator;
use qflow_dispatcher::Dispatcher;
use qflow_isolation::{IsolationScope, IsolationStateStore, ResourceAccountant};
use qflow_ledger::{Ledger, SledLedgerStore};
use qflow_node::engine::{QflowEngine, StepJob};
use qflow_node::executor::ScriptedActionExecutor;
use qflow_sandbox::{SandboxError, SandboxResult, StateAccess};
use qflow_state_machine::FlowInterpreter;
use qflow_validation::ValidationPipeline;
use tokio::sync::mpsc;

struct Harness {
    engine: Arc<QflowEngine>,
    rx: mpsc::Receiver<StepJob>,
    permission: Arc<AllowListPermissionChecker>,
    executor: Arc<ScriptedActionExecutor>,
    db: sled::Db,
    _dir: tempfile::TempDir,
}

fn build_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledLedgerStore::open(&db, "ledger").unwrap();
    let ledger = Arc::new(Ledger::new(Arc::new(store)));

    let interpreter = Arc::new(FlowInterpreter::new(ledger.clone()));
    let dispatcher = Arc::new(Dispatcher::new(Default::default(), Default::default()));
    let transport = Arc::new(InProcessPeerTransport::default());
    let coordinator = Arc::new(Coordinator::new(NodeId::from("node-test"), transport));
    let isolation_store = Arc::new(IsolationStateStore::new());
    let accountant = Arc::new(ResourceAccountant::new());

    let permission = Arc::new(AllowListPermissionChecker::new());
    let validation = Arc::new(ValidationPipeline::new(
        Arc::new(HashDerivedEncryptionService),
        permission.clone(),
        Arc::new(InMemoryIndexService::new()),
        Arc::new(SharedSecretSignatureVerifier::new()),
        None,
    ));

    let executor = Arc::new(ScriptedActionExecutor::new());

    let (tx, rx) = mpsc::channel(64);
    let engine = Arc::new(QflowEngine::new(
        Config::default(),
        NodeId::from("node-test"),
        ledger,
        interpreter,
        dispatcher,
        coordinator,
        isolation_store,
        accountant,
        validation,
        executor.clone(),
        tx,
    ));

    engine.register_node(
        NodeId::from("n1"),
        NodeCapabilities {
            supported_runtimes: vec!["wasm32".into()],
            max_concurrent_steps: 8,
            max_memory_mb: 1024,
            max_cpu_cores: 4,
        },
    );

    Harness { engine, rx, permission, executor, db, _dir: dir }
}

fn tenant(id: &str) -> TenantContext {
    TenantContext {
        tenant_id: TenantId::from(id),
        dao_subnet_id: DaoSubnetId::from("subnet-1"),
        allowed_resources: HashSet::new(),
        encryption_key_refs: Vec::new(),
        quotas: ResourceQuotas {
            max_concurrent_flows: 16,
            max_memory_mb: 1024,
            max_cpu_cores: 8,
            max_storage_gb: 10,
            max_network_mbps: 100,
            max_step_wall_time_ms: 60_000,
        },
    }
}

fn step(id: &str, action: &str, deps: &[&str]) -> Step {
    Step {
        step_id: StepId::from(id),
        kind: StepKind::Action,
        action: action.to_string(),
        parameters: serde_json::json!({}),
        dependencies: deps.iter().map(|d| StepId::from(*d)).collect(),
        node_preference: None,
        timeout_ms: None,
        retry_policy: None,
    }
}

fn grant(permission: &AllowListPermissionChecker, identity: &str, tenant_id: &TenantId, dao: &DaoSubnetId, action: &str) {
    permission.grant(&PermissionRequest {
        identity: identity.to_string(),
        tenant_id: tenant_id.clone(),
        dao_subnet_id: dao.clone(),
        action: action.to_string(),
        resource: format!("action:{}", action),
    });
}

fn echo_result(output: serde_json::Value) -> Result<SandboxResult, SandboxError> {
    Ok(SandboxResult {
        output: serde_json::to_vec(&output).unwrap(),
        emitted_events: Vec::new(),
        fuel_consumed: 0,
    })
}

/// Polls until the execution reaches a terminal status, driving the
/// sandbox worker loop inline (this test harness has no worker pool
/// running in the background).
async fn drain(engine: &Arc<QflowEngine>, rx: &mut mpsc::Receiver<StepJob>, exec_id: &ExecId) {
    loop {
        let status = engine.get_execution_status(exec_id).await.unwrap().status;
        if status.is_terminal() {
            return;
        }
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(job)) => engine.run_step(job).await,
            _ => return,
        }
    }
}

fn context(user: &str, tenant_id: &str, correlation: &str) -> ExecutionContext {
    ExecutionContext {
        user_id: user.to_string(),
        tenant_id: TenantId::from(tenant_id),
        dao_subnet_id: DaoSubnetId::from("subnet-1"),
        correlation_id: correlation.to_string(),
    }
}

/// S1: three sequential steps all succeed; every ledger entry this
/// produces is accounted for (FlowStarted/StepReady/Leased/Started/
/// Completed per step, FlowCompleted).
#[tokio::test]
async fn s1_simple_sequential_flow_completes() {
    let mut h = build_harness();
    h.engine.register_tenant(tenant("tenant-a"));
    grant(&h.permission, "user-1", &TenantId::from("tenant-a"), &DaoSubnetId::from("subnet-1"), "echo");

    h.executor.register("echo", |payload, _state| {
        let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
        echo_result(v)
    });

    let flow = Flow {
        flow_id: FlowId::from("f1"),
        name: "sequential".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: TenantId::from("tenant-a"),
        dao_subnet_id: DaoSubnetId::from("subnet-1"),
        priority: Priority::Normal,
        steps: vec![
            step("s1", "echo", &[]),
            step("s2", "echo", &["s1"]),
            step("s3", "echo", &["s2"]),
        ],
    };
    h.engine.submit_flow(flow).await.unwrap();

    let exec_id = h
        .engine
        .start_execution(&FlowId::from("f1"), serde_json::json!({"n": 1}), context("user-1", "tenant-a", "corr-1"))
        .await
        .unwrap();

    drain(&h.engine, &mut h.rx, &exec_id).await;

    let status = h.engine.get_execution_status(&exec_id).await.unwrap();
    assert_eq!(status.status, qflow_common::ExecutionStatus::Completed);
    assert_eq!(status.completed_steps.len(), 3);
    assert!(status.running_steps.is_empty());

    let entries = h.engine.get_execution_ledger(&exec_id, None, None).await.unwrap();
    assert_eq!(entries.len(), 14);
    assert_eq!(entries[0].kind, LedgerEntryKind::FlowStarted);
    assert_eq!(entries.last().unwrap().kind, LedgerEntryKind::FlowCompleted);
}

/// S2: a fatal step failure triggers the flow's `on_failure` step before
/// the execution is marked `Failed`. `on_failure` is kept permanently
/// `Blocked` under normal completion by giving it a dependency id that
/// never resolves, so it is only reached through the failure-propagation
/// path the interpreter provides for it.
#[tokio::test]
async fn s2_fatal_failure_runs_on_failure_then_fails_flow() {
    let mut h = build_harness();
    h.engine.register_tenant(tenant("tenant-a"));
    let t = TenantId::from("tenant-a");
    let d = DaoSubnetId::from("subnet-1");
    grant(&h.permission, "user-1", &t, &d, "echo");
    grant(&h.permission, "user-1", &t, &d, "boom");

    h.executor.register("echo", |payload, _state| {
        let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
        echo_result(v)
    });
    h.executor.register("boom", |_payload, _state| Err(SandboxError::Trap("boom".into())));

    let flow = Flow {
        flow_id: FlowId::from("f2"),
        name: "failure-handling".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: t.clone(),
        dao_subnet_id: d.clone(),
        priority: Priority::Normal,
        steps: vec![
            step("s1", "echo", &[]),
            step("s2", "boom", &["s1"]),
            step("on_failure", "echo", &["__never__"]),
        ],
    };
    h.engine.submit_flow(flow).await.unwrap();

    let exec_id = h
        .engine
        .start_execution(&FlowId::from("f2"), serde_json::json!({}), context("user-1", "tenant-a", "corr-2"))
        .await
        .unwrap();

    drain(&h.engine, &mut h.rx, &exec_id).await;

    let status = h.engine.get_execution_status(&exec_id).await.unwrap();
    assert_eq!(status.status, qflow_common::ExecutionStatus::Failed);
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].kind, "Trap");
    assert_eq!(status.errors[0].step_id, Some(StepId::from("s2")));

    let entries = h.engine.get_execution_ledger(&exec_id, None, None).await.unwrap();
    assert_eq!(entries.last().unwrap().kind, LedgerEntryKind::FlowFailed);
    assert!(entries.iter().any(|e| e.kind == LedgerEntryKind::StepReady && e.payload.get("compensation").is_some()));
}

/// S3 (structural): two independent steps fan into a third; the join
/// only becomes ready once both of its dependencies have completed.
#[tokio::test]
async fn s3_parallel_fan_in_completes_once_both_branches_finish() {
    let mut h = build_harness();
    h.engine.register_tenant(tenant("tenant-a"));
    let t = TenantId::from("tenant-a");
    let d = DaoSubnetId::from("subnet-1");
    grant(&h.permission, "user-1", &t, &d, "echo");

    h.executor.register("echo", |payload, _state| {
        let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
        echo_result(v)
    });

    let flow = Flow {
        flow_id: FlowId::from("f3"),
        name: "fan-in".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: t.clone(),
        dao_subnet_id: d.clone(),
        priority: Priority::Normal,
        steps: vec![
            step("a", "echo", &[]),
            step("b", "echo", &[]),
            step("c", "echo", &["a", "b"]),
        ],
    };
    h.engine.submit_flow(flow).await.unwrap();

    let exec_id = h
        .engine
        .start_execution(&FlowId::from("f3"), serde_json::json!({}), context("user-1", "tenant-a", "corr-3"))
        .await
        .unwrap();

    drain(&h.engine, &mut h.rx, &exec_id).await;

    let status = h.engine.get_execution_status(&exec_id).await.unwrap();
    assert_eq!(status.status, qflow_common::ExecutionStatus::Completed);
    let mut ids: Vec<String> = status.completed_steps.iter().map(|s| s.as_str().to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
}

/// S4: the node holding a step's lease goes offline mid-flight; the step
/// is recovered onto a healthy node. Driven directly against the real
/// `dispatcher`/`interpreter` pair `QflowEngine::run_step` itself calls,
/// since reproducing a genuinely mid-flight sandbox invocation would need
/// a contrived multi-threaded rendezvous that adds no extra coverage over
/// exercising the same two components the engine wires together.
#[tokio::test]
async fn s4_node_failover_recovers_the_step_on_another_node() {
    let h = build_harness();
    h.engine.register_node(
        NodeId::from("n2"),
        NodeCapabilities {
            supported_runtimes: vec!["wasm32".into()],
            max_concurrent_steps: 8,
            max_memory_mb: 1024,
            max_cpu_cores: 4,
        },
    );
    let t = TenantId::from("tenant-a");
    let d = DaoSubnetId::from("subnet-1");

    let flow = Flow {
        flow_id: FlowId::from("f4"),
        name: "failover".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: t.clone(),
        dao_subnet_id: d.clone(),
        priority: Priority::Normal,
        steps: vec![step("only", "echo", &[])],
    };
    let step_def = flow.step(&StepId::from("only")).unwrap().clone();
    let exec_id = ExecId::from("exec-f4");
    let now = qflow_common::time::now_seconds();

    let mut exec = qflow_common::Execution {
        exec_id: exec_id.clone(),
        flow_id: flow.flow_id.clone(),
        input: serde_json::json!({}),
        context: context("user-1", "tenant-a", "corr-4"),
        status: qflow_common::ExecutionStatus::Pending,
        step_states: Default::default(),
        counters: Default::default(),
        errors: Vec::new(),
    };

    h.engine.interpreter.start_execution(&flow, &mut exec, now).await.unwrap();

    let lease = h
        .engine
        .dispatcher
        .select_and_lease(exec_id.clone(), &step_def, t.clone(), u32::MAX, 0, now, 15_000, false)
        .unwrap();
    assert_eq!(lease.node_id, NodeId::from("n1"));
    h.engine.interpreter.lease_step(&mut exec, &step_def.step_id, lease.node_id.clone(), now).await.unwrap();

    // `n1` goes offline before it ever acks the start of the step.
    let reclaimed = h.engine.dispatcher.reclaim_offline_node(&NodeId::from("n1"));
    assert_eq!(reclaimed.len(), 1);
    h.engine.interpreter.node_failover(&mut exec, &step_def.step_id, now).await.unwrap();
    assert_eq!(exec.counters.node_failures, 1);

    // Redispatch lands on the one remaining healthy node.
    let lease2 = h
        .engine
        .dispatcher
        .select_and_lease(exec_id.clone(), &step_def, t.clone(), u32::MAX, 0, now, 15_000, false)
        .unwrap();
    assert_eq!(lease2.node_id, NodeId::from("n2"));
    h.engine.interpreter.lease_step(&mut exec, &step_def.step_id, lease2.node_id.clone(), now).await.unwrap();
    h.engine.interpreter.step_started(&mut exec, &step_def.step_id, now).await.unwrap();
    h.engine
        .interpreter
        .step_completed(&flow, &mut exec, &step_def.step_id, serde_json::json!({"ok": true}), now)
        .await
        .unwrap();
    h.engine.interpreter.complete_execution_if_done(&flow, &mut exec, now).await.unwrap();

    assert_eq!(exec.status, qflow_common::ExecutionStatus::Completed);
}

/// S5: tenant-1 writes a key into its isolation scope; tenant-2, reading
/// the same key name, never sees it — isolation is enforced at the
/// `IsolationStateStore` key, not by any check in the flow itself.
#[tokio::test]
async fn s5_cross_tenant_state_is_isolated() {
    let mut h = build_harness();
    h.engine.register_tenant(tenant("tenant-1"));
    h.engine.register_tenant(tenant("tenant-2"));

    grant(&h.permission, "user-1", &TenantId::from("tenant-1"), &DaoSubnetId::from("subnet-1"), "write_secret");
    grant(&h.permission, "user-2", &TenantId::from("tenant-2"), &DaoSubnetId::from("subnet-1"), "read_secret");

    h.executor.register("write_secret", |_payload, state: &dyn StateAccess| {
        state.write_state("secret", b"tenant-1-value".to_vec());
        echo_result(serde_json::json!({"wrote": true}))
    });
    h.executor.register("read_secret", |_payload, state: &dyn StateAccess| {
        let found = state.read_state("secret")?.is_some();
        echo_result(serde_json::json!({"found": found}))
    });

    let write_flow = Flow {
        flow_id: FlowId::from("f5-write"),
        name: "write-secret".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: TenantId::from("tenant-1"),
        dao_subnet_id: DaoSubnetId::from("subnet-1"),
        priority: Priority::Normal,
        steps: vec![step("write", "write_secret", &[])],
    };
    let read_flow = Flow {
        flow_id: FlowId::from("f5-read"),
        name: "read-secret".into(),
        version: 1,
        owner: "user-2".into(),
        tenant_id: TenantId::from("tenant-2"),
        dao_subnet_id: DaoSubnetId::from("subnet-1"),
        priority: Priority::Normal,
        steps: vec![step("read", "read_secret", &[])],
    };
    h.engine.submit_flow(write_flow).await.unwrap();
    h.engine.submit_flow(read_flow).await.unwrap();

    let write_exec = h
        .engine
        .start_execution(&FlowId::from("f5-write"), serde_json::json!({}), context("user-1", "tenant-1", "corr-5w"))
        .await
        .unwrap();
    drain(&h.engine, &mut h.rx, &write_exec).await;
    assert_eq!(
        h.engine.get_execution_status(&write_exec).await.unwrap().status,
        qflow_common::ExecutionStatus::Completed
    );

    let read_exec = h
        .engine
        .start_execution(&FlowId::from("f5-read"), serde_json::json!({}), context("user-2", "tenant-2", "corr-5r"))
        .await
        .unwrap();
    drain(&h.engine, &mut h.rx, &read_exec).await;

    let status = h.engine.get_execution_status(&read_exec).await.unwrap();
    assert_eq!(status.status, qflow_common::ExecutionStatus::Failed);
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].kind, "IsolationViolation");

    let entries = h.engine.get_execution_ledger(&read_exec, None, None).await.unwrap();
    assert!(
        entries.iter().all(|e| e.payload.get("found").is_none()),
        "tenant-1's value must never appear in tenant-2's ledger"
    );

    // Direct check against the shared store confirms the isolation scope
    // keys, not just the script's own result.
    let scope_2 = IsolationScope { tenant_id: TenantId::from("tenant-2"), dao_subnet_id: DaoSubnetId::from("subnet-1") };
    assert!(matches!(h.engine.isolation_store.read(&scope_2, "secret"), Err(_)));
    let scope_1 = IsolationScope { tenant_id: TenantId::from("tenant-1"), dao_subnet_id: DaoSubnetId::from("subnet-1") };
    assert_eq!(h.engine.isolation_store.read(&scope_1, "secret").unwrap(), Some(b"tenant-1-value".to_vec()));
}

/// S6: a tampered ledger entry is caught by `verify_ledger`, which also
/// flips the execution to `Failed` so no further leases are granted.
#[tokio::test]
async fn s6_ledger_tamper_is_detected_and_fails_the_execution() {
    let mut h = build_harness();
    h.engine.register_tenant(tenant("tenant-a"));
    let t = TenantId::from("tenant-a");
    let d = DaoSubnetId::from("subnet-1");
    grant(&h.permission, "user-1", &t, &d, "echo");

    h.executor.register("echo", |payload, _state| {
        let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
        echo_result(v)
    });

    let flow = Flow {
        flow_id: FlowId::from("f6"),
        name: "tamper".into(),
        version: 1,
        owner: "user-1".into(),
        tenant_id: t.clone(),
        dao_subnet_id: d.clone(),
        priority: Priority::Normal,
        steps: vec![step("s1", "echo", &[]), step("s2", "echo", &["s1"])],
    };
    h.engine.submit_flow(flow).await.unwrap();

    let exec_id = h
        .engine
        .start_execution(&FlowId::from("f6"), serde_json::json!({}), context("user-1", "tenant-a", "corr-6"))
        .await
        .unwrap();

    drain(&h.engine, &mut h.rx, &exec_id).await;
    assert!(h.engine.verify_ledger(&exec_id).await.unwrap());

    // Flip a middle entry's payload directly in storage, bypassing the
    // ledger API (mirrors qflow-ledger's own tamper test).
    let tree = h.db.open_tree("ledger").unwrap();
    let key = {
        let mut k = exec_id.as_str().as_bytes().to_vec();
        k.push(0);
        k.extend_from_slice(&2u64.to_be_bytes());
        k
    };
    let raw = tree.get(&key).unwrap().unwrap();
    let mut tampered: qflow_common::LedgerEntry = serde_json::from_slice(&raw).unwrap();
    tampered.payload = serde_json::json!({"tampered": true});
    tree.insert(&key, serde_json::to_vec(&tampered).unwrap()).unwrap();

    let err = h.engine.verify_ledger(&exec_id).await.unwrap_err();
    assert!(matches!(err, qflow_node::QflowError::Ledger(qflow_ledger::LedgerError::IntegrityViolation { .. })));

    let status = h.engine.get_execution_status(&exec_id).await.unwrap();
    assert_eq!(status.status, qflow_common::ExecutionStatus::Failed);
    assert!(status.errors.iter().any(|e| e.kind == "IntegrityViolation"));
}
