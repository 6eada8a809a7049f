//! Node-local task wiring: a fixed-size sandbox worker pool, a coordinator
//! heartbeat/partition sweep, and a metrics task. The per-execution ledger
//! writer is already serialized inside [`qflow_ledger::Ledger`] itself, so
//! it needs no separate task here.

use std::sync::Arc;

use qflow_common::time::now_seconds;
use tokio::sync::{broadcast, mpsc};

use crate::engine::{QflowEngine, StepJob};

/// Spawns the sandbox worker pool, the coordinator sweep, and the metrics
/// task, all exiting when `shutdown` fires. Returns their join handles so
/// the caller can await a clean stop.
pub fn spawn(
    engine: Arc<QflowEngine>,
    step_rx: mpsc::Receiver<StepJob>,
    worker_count: usize,
    heartbeat_interval_ms: u64,
    missed_heartbeat_threshold: u32,
    shutdown: broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    handles.push(spawn_worker_pool(engine.clone(), step_rx, worker_count, shutdown.subscribe()));
    handles.push(spawn_coordinator_task(
        engine.clone(),
        heartbeat_interval_ms,
        missed_heartbeat_threshold,
        shutdown.subscribe(),
    ));
    handles.push(spawn_metrics_task(engine, heartbeat_interval_ms, shutdown.subscribe()));
    handles
}

/// A fixed-size pool of workers pulling from the shared ready-step channel:
/// a bounded pool of sandbox worker tasks, sized at startup, not one task
/// per step.
fn spawn_worker_pool(
    engine: Arc<QflowEngine>,
    step_rx: mpsc::Receiver<StepJob>,
    worker_count: usize,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let step_rx = Arc::new(tokio::sync::Mutex::new(step_rx));
    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count.max(1) {
        let engine = engine.clone();
        let step_rx = step_rx.clone();
        let mut shutdown = shutdown.resubscribe();
        workers.push(tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = step_rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shutdown.recv() => None,
                    }
                };
                match job {
                    Some(job) => engine.run_step(job).await,
                    None => break,
                }
            }
            log::debug!("qflow: sandbox worker {} stopped", id);
        }));
    }
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        for w in workers {
            w.abort();
        }
    })
}

/// Heartbeat and partition-check sweep.
fn spawn_coordinator_task(
    engine: Arc<QflowEngine>,
    heartbeat_interval_ms: u64,
    missed_heartbeat_threshold: u32,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let offline = engine.sweep_heartbeats(missed_heartbeat_threshold).await;
                    for node_id in offline {
                        log::warn!("qflow: node {} marked offline, leases reclaimed", node_id);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        log::debug!("qflow: coordinator task stopped");
    })
}

/// Periodic load snapshot logging. No external metrics sink is wired up;
/// this logs the fleet-wide autoscale signal at `info` instead.
fn spawn_metrics_task(
    engine: Arc<QflowEngine>,
    heartbeat_interval_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval_ms * 5));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let signal = engine.dispatcher.autoscale_signal();
                    log::info!("qflow: autoscale signal {:?} at t={}", signal, now_seconds());
                }
                _ = shutdown.recv() => break,
            }
        }
        log::debug!("qflow: metrics task stopped");
    })
}
