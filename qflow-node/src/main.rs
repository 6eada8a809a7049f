//! Single-node Qflow binary: parses configuration, wires every component,
//! and runs until `SIGINT`/`SIGTERM`.

use std::sync::Arc;

use clap::Parser;
use qflow_collaborators::{
    AllowListPermissionChecker, HashDerivedEncryptionService, InMemoryIndexService,
    InProcessPeerTransport, SharedSecretSignatureVerifier,
};
use qflow_common::NodeId;
use qflow_coordination::Coordinator;
use qflow_dispatcher::Dispatcher;
use qflow_isolation::{IsolationStateStore, ResourceAccountant};
use qflow_ledger::{Ledger, SledLedgerStore};
use qflow_node::config::Cli;
use qflow_node::engine::QflowEngine;
use qflow_node::executor::SandboxActionExecutor;
use qflow_node::{logging, tasks};
use qflow_sandbox::ModuleRegistry;
use qflow_state_machine::FlowInterpreter;
use qflow_validation::ValidationPipeline;

const SANDBOX_WORKER_COUNT: usize = 8;
const MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve()?;
    logging::init(&config.log_level, config.log_file.as_deref());

    log::info!("qflow: starting node {}", config.node_id);

    std::fs::create_dir_all(&cli.data_dir)?;
    let db = sled::open(&cli.data_dir)?;
    let ledger_store = SledLedgerStore::open(&db, "ledger")?;
    let ledger = Arc::new(Ledger::new(Arc::new(ledger_store)));

    let interpreter = Arc::new(FlowInterpreter::new(ledger.clone()));
    let dispatcher = Arc::new(Dispatcher::new(config.scoring_weights, config.autoscale_thresholds));
    let transport = Arc::new(InProcessPeerTransport::default());
    let coordinator = Arc::new(Coordinator::new(NodeId::from(config.node_id.as_str()), transport));
    let isolation_store = Arc::new(IsolationStateStore::new());
    let accountant = Arc::new(ResourceAccountant::new());

    let module_registry = Arc::new(ModuleRegistry::new());
    let executor = Arc::new(SandboxActionExecutor::new(module_registry.clone())?);

    let validation = Arc::new(ValidationPipeline::new(
        Arc::new(HashDerivedEncryptionService),
        Arc::new(AllowListPermissionChecker::new()),
        Arc::new(InMemoryIndexService::new()),
        Arc::new(SharedSecretSignatureVerifier::new()),
        None,
    ));

    let (step_tx, step_rx) = tokio::sync::mpsc::channel(config.max_concurrent_steps as usize * 4);

    let engine = Arc::new(QflowEngine::new(
        config.clone(),
        NodeId::from(config.node_id.as_str()),
        ledger,
        interpreter,
        dispatcher,
        coordinator,
        isolation_store,
        accountant,
        validation,
        executor,
        step_tx,
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let handles = tasks::spawn(
        engine,
        step_rx,
        SANDBOX_WORKER_COUNT,
        config.heartbeat_interval_ms,
        MISSED_HEARTBEAT_THRESHOLD,
        shutdown_tx.clone(),
    );

    tokio::signal::ctrl_c().await?;
    log::info!("qflow: shutdown signal received");
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
