use queuectl_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that abort a worker or the supervisor.
///
/// Transient storage trouble never surfaces here; the loop logs it and
/// retries. What does surface is the fatal class: schema mismatches,
/// corrupt rows, broken connections.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("worker task did not run to completion: {0}")]
    Join(#[from] tokio::task::JoinError),
}
