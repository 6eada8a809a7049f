//! Per-flow interpreter: step graph traversal, dependencies, retries,
//! pause/resume — Qflow component C5.

pub mod error;
pub mod interpreter;
pub mod runtime;

pub use error::StateMachineError;
pub use interpreter::{FlowInterpreter, ON_FAILURE_STEP_ID};
pub use runtime::{synthetic_step_id, ExecutionRuntime, LoopRuntime};

#[cfg(test)]
mod tests {
    use super::*;
    use qflow_common::{
        DaoSubnetId, ExecId, Execution, ExecutionContext, ExecutionCounters, ExecutionStatus,
        Flow, FlowId, NodeId, Priority, RetryPolicy, Step, StepId, StepKind, StepStatus, TenantId,
    };
    use qflow_ledger::{Ledger, SledLedgerStore};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ledger() -> (Arc<Ledger>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledLedgerStore::open(&db, "ledger").unwrap();
        (Arc::new(Ledger::new(Arc::new(store))), dir)
    }

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: StepId::from(id),
            kind: StepKind::Action,
            action: "noop".into(),
            parameters: serde_json::json!({}),
            dependencies: deps.iter().map(|d| StepId::from(*d)).collect(),
            node_preference: None,
            timeout_ms: None,
            retry_policy: Some(RetryPolicy { max: 2, base_backoff_ms: 1, jitter_ms: 0 }),
        }
    }

    fn flow(steps: Vec<Step>) -> Flow {
        Flow {
            flow_id: FlowId::from("flow-1"),
            name: "test".into(),
            version: 1,
            owner: "owner".into(),
            tenant_id: TenantId::from("tenant-a"),
            dao_subnet_id: DaoSubnetId::from("subnet-1"),
            priority: Priority::Normal,
            steps,
        }
    }

    fn execution(flow_id: &FlowId) -> Execution {
        Execution {
            exec_id: ExecId::from("exec-1"),
            flow_id: flow_id.clone(),
            input: serde_json::json!({}),
            context: ExecutionContext {
                user_id: "user-1".into(),
                tenant_id: TenantId::from("tenant-a"),
                dao_subnet_id: DaoSubnetId::from("subnet-1"),
                correlation_id: "corr-1".into(),
            },
            status: ExecutionStatus::Pending,
            step_states: Default::default(),
            counters: ExecutionCounters::default(),
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn linear_flow_runs_to_completion() {
        let (ledger, _dir) = ledger();
        let interp = FlowInterpreter::new(ledger);
        let f = flow(vec![step("a", &[]), step("b", &["a"])]);
        let mut exec = execution(&f.flow_id);

        let ready = interp.start_execution(&f, &mut exec, 1).await.unwrap();
        assert_eq!(ready, vec![StepId::from("a")]);

        interp
            .lease_step(&mut exec, &StepId::from("a"), NodeId::from("node-1"), 2)
            .await
            .unwrap();
        interp.step_started(&mut exec, &StepId::from("a"), 3).await.unwrap();
        let ready = interp
            .step_completed(&f, &mut exec, &StepId::from("a"), serde_json::json!({}), 4)
            .await
            .unwrap();
        assert_eq!(ready, vec![StepId::from("b")]);

        interp
            .lease_step(&mut exec, &StepId::from("b"), NodeId::from("node-1"), 5)
            .await
            .unwrap();
        interp.step_started(&mut exec, &StepId::from("b"), 6).await.unwrap();
        interp
            .step_completed(&f, &mut exec, &StepId::from("b"), serde_json::json!({}), 7)
            .await
            .unwrap();

        assert!(interp.is_flow_complete(&f, &exec));
        let done = interp.complete_execution_if_done(&f, &mut exec, 8).await.unwrap();
        assert!(done);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_fan_out_and_fan_in() {
        let (ledger, _dir) = ledger();
        let interp = FlowInterpreter::new(ledger);
        let f = flow(vec![
            step("split", &[]),
            step("a", &["split"]),
            step("b", &["split"]),
            step("merge", &["a", "b"]),
        ]);
        let mut exec = execution(&f.flow_id);

        let ready = interp.start_execution(&f, &mut exec, 1).await.unwrap();
        assert_eq!(ready, vec![StepId::from("split")]);

        for id in ["split"] {
            interp.lease_step(&mut exec, &StepId::from(id), NodeId::from("n"), 2).await.unwrap();
            interp.step_started(&mut exec, &StepId::from(id), 3).await.unwrap();
        }
        let ready = interp
            .step_completed(&f, &mut exec, &StepId::from("split"), serde_json::json!({}), 4)
            .await
            .unwrap();
        let ready: HashSet<_> = ready.into_iter().collect();
        assert_eq!(ready, HashSet::from([StepId::from("a"), StepId::from("b")]));

        for id in ["a", "b"] {
            interp.lease_step(&mut exec, &StepId::from(id), NodeId::from("n"), 5).await.unwrap();
            interp.step_started(&mut exec, &StepId::from(id), 6).await.unwrap();
        }
        interp
            .step_completed(&f, &mut exec, &StepId::from("a"), serde_json::json!({}), 7)
            .await
            .unwrap();
        let ready = interp
            .step_completed(&f, &mut exec, &StepId::from("b"), serde_json::json!({}), 8)
            .await
            .unwrap();
        assert_eq!(ready, vec![StepId::from("merge")]);
    }

    #[tokio::test]
    async fn retryable_failure_returns_to_ready_then_exhausts_to_fatal() {
        let (ledger, _dir) = ledger();
        let interp = FlowInterpreter::new(ledger);
        let f = flow(vec![step("a", &[])]);
        let mut exec = execution(&f.flow_id);
        interp.start_execution(&f, &mut exec, 1).await.unwrap();

        for attempt in 0..2 {
            interp
                .lease_step(&mut exec, &StepId::from("a"), NodeId::from("n"), 2 + attempt)
                .await
                .unwrap();
            interp.step_started(&mut exec, &StepId::from("a"), 2 + attempt).await.unwrap();
            let ready = interp
                .step_failed(&f, &mut exec, &StepId::from("a"), "Timeout", 2 + attempt)
                .await
                .unwrap();
            assert_eq!(ready, vec![StepId::from("a")]);
        }

        interp.lease_step(&mut exec, &StepId::from("a"), NodeId::from("n"), 10).await.unwrap();
        interp.step_started(&mut exec, &StepId::from("a"), 10).await.unwrap();
        interp
            .step_failed(&f, &mut exec, &StepId::from("a"), "Timeout", 10)
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(
            exec.step_states[&StepId::from("a")].current_status(),
            StepStatus::FatalFailed
        );
    }

    #[tokio::test]
    async fn fatal_failure_runs_on_failure_before_flow_fails() {
        let (ledger, _dir) = ledger();
        let interp = FlowInterpreter::new(ledger);
        let mut f = flow(vec![step("a", &[])]);
        let mut on_failure = step("on_failure", &[]);
        on_failure.retry_policy = None;
        f.steps.push(on_failure);
        let mut exec = execution(&f.flow_id);
        interp.start_execution(&f, &mut exec, 1).await.unwrap();

        interp.lease_step(&mut exec, &StepId::from("a"), NodeId::from("n"), 2).await.unwrap();
        interp.step_started(&mut exec, &StepId::from("a"), 2).await.unwrap();
        let triggered = interp
            .step_failed(&f, &mut exec, &StepId::from("a"), "Trap", 3)
            .await
            .unwrap();
        assert_eq!(triggered, vec![StepId::from("on_failure")]);
        // Flow must not be Failed yet: compensation hasn't finished.
        assert_eq!(exec.status, ExecutionStatus::Running);

        interp
            .lease_step(&mut exec, &StepId::from("on_failure"), NodeId::from("n"), 4)
            .await
            .unwrap();
        interp.step_started(&mut exec, &StepId::from("on_failure"), 4).await.unwrap();
        interp
            .step_completed(&f, &mut exec, &StepId::from("on_failure"), serde_json::json!({}), 5)
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn loop_unrolls_until_guard_false() {
        let (ledger, _dir) = ledger();
        let interp = FlowInterpreter::new(ledger);
        let mut loop_step = step("loop1", &[]);
        loop_step.kind = StepKind::Loop;
        let f = flow(vec![loop_step]);
        let mut exec = execution(&f.flow_id);

        interp.start_execution(&f, &mut exec, 1).await.unwrap();
        // The loop header self-completes; iteration 0 is materialized and
        // ready immediately since it shares the header's dependencies.
        let iter0 = StepId::from("loop1#0");
        assert_eq!(
            exec.step_states[&StepId::from("loop1")].current_status(),
            StepStatus::Completed
        );
        assert_eq!(
            exec.step_states.get(&iter0).map(|s| s.current_status()),
            Some(StepStatus::Ready)
        );

        interp.lease_step(&mut exec, &iter0, NodeId::from("n"), 2).await.unwrap();
        interp.step_started(&mut exec, &iter0, 2).await.unwrap();
        let ready = interp
            .step_completed(&f, &mut exec, &iter0, serde_json::json!({"loop_continue": true}), 3)
            .await
            .unwrap();
        let iter1 = StepId::from("loop1#1");
        assert_eq!(ready, vec![iter1.clone()]);

        interp.lease_step(&mut exec, &iter1, NodeId::from("n"), 4).await.unwrap();
        interp.step_started(&mut exec, &iter1, 4).await.unwrap();
        interp
            .step_completed(&f, &mut exec, &iter1, serde_json::json!({"loop_continue": false}), 5)
            .await
            .unwrap();

        assert!(interp.is_flow_complete(&f, &exec));
    }
}
