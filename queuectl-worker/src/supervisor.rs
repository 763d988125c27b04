//! Owns worker lifetimes and signal reception.
//!
//! The supervisor spawns N worker loops as parallel tasks, traps the
//! termination signals itself, and publishes shutdown to the workers through
//! a cancellation token. It never touches job state: draining means waiting
//! for every worker to finish whatever it already claimed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use queuectl_common::runner::ShellRunner;
use queuectl_common::store::Store;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::worker::QueueWorker;

/// A spawned worker loop and the id it registered under.
pub struct WorkerHandle {
    pub worker_id: i64,
    handle: JoinHandle<Result<(), WorkerError>>,
}

/// Run `count` workers against the store at `db_path` until a termination
/// signal arrives, then drain them.
pub async fn run(count: usize, db_path: &Path, config: WorkerConfig) -> Result<(), WorkerError> {
    let shutdown = CancellationToken::new();
    let workers = spawn_workers(count, db_path, config, &shutdown).await?;

    info!(count, "workers running, press Ctrl+C to stop");

    wait_for_shutdown_signal().await;

    info!("shutdown requested, draining workers");
    shutdown.cancel();
    join_workers(workers).await;

    Ok(())
}

/// Spawn `count` worker loops, each with its own long-lived store handle and
/// a child of the given shutdown token.
pub async fn spawn_workers(
    count: usize,
    db_path: &Path,
    config: WorkerConfig,
    shutdown: &CancellationToken,
) -> Result<Vec<WorkerHandle>, WorkerError> {
    let db_path = PathBuf::from(db_path);
    let mut workers = Vec::with_capacity(count);

    for slot in 0..count {
        let worker_id = worker_id_for_slot(slot);
        let store = Store::open(&db_path).await?;
        let worker = QueueWorker::new(
            worker_id,
            store,
            Arc::new(ShellRunner),
            config.clone(),
            shutdown.child_token(),
        );

        info!(worker_id, "started worker");
        workers.push(WorkerHandle {
            worker_id,
            handle: tokio::spawn(worker.run()),
        });
    }

    Ok(workers)
}

/// Await every worker. In-flight jobs finish first; failures are logged, not
/// propagated, so one broken worker cannot cut the drain short.
pub async fn join_workers(workers: Vec<WorkerHandle>) {
    for worker in workers {
        match worker.handle.await {
            Ok(Ok(())) => info!(worker_id = worker.worker_id, "worker exited"),
            Ok(Err(error)) => {
                error!(worker_id = worker.worker_id, %error, "worker exited with error");
            }
            Err(error) => {
                error!(worker_id = worker.worker_id, %error, "worker task failed");
            }
        }
    }
}

/// All workers share one process, so the pid alone cannot identify a slot.
fn worker_id_for_slot(slot: usize) -> i64 {
    i64::from(std::process::id()) * 1000 + slot as i64
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
