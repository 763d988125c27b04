//! The per-worker control loop.
//!
//! A worker registers its presence, then repeatedly claims one eligible job,
//! hands the command to its runner, and records the outcome. Shutdown is
//! cooperative: the supervisor cancels the worker's token, and the loop
//! observes it between jobs, never mid-execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use queuectl_common::retry::DEFAULT_BACKOFF_BASE;
use queuectl_common::runner::{CommandRunner, RunOutput};
use queuectl_common::store::{self, FailureOutcome, Job, Store, StoreError};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Runner-derived diagnostics are cut harder than the store's own limit so a
/// chatty command cannot flood the row.
const MAX_RUNNER_ERROR_CHARS: usize = 300;

/// A worker that polls the store and executes claimed jobs one at a time.
pub struct QueueWorker {
    /// Identifies this worker in the workers table and in logs.
    worker_id: i64,
    /// Long-lived store handle, owned by this worker for its whole life.
    store: Store,
    /// Executes job payloads. Injected so tests can script outcomes.
    runner: Arc<dyn CommandRunner>,
    config: WorkerConfig,
    /// Cancelled by the supervisor; observed between jobs only.
    shutdown: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        worker_id: i64,
        store: Store,
        runner: Arc<dyn CommandRunner>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            store,
            runner,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled. An in-flight job always
    /// finishes and has its outcome recorded before the loop exits.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.store.register_worker(self.worker_id).await?;
        info!(worker_id = self.worker_id, "worker registered");

        let mut last_heartbeat: Option<Instant> = None;

        while !self.shutdown.is_cancelled() {
            if last_heartbeat.map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval.0) {
                // Advisory liveness only; a missed beat is not fatal.
                if let Err(error) = self.store.heartbeat_worker(self.worker_id).await {
                    warn!(worker_id = self.worker_id, %error, "heartbeat failed");
                }
                last_heartbeat = Some(Instant::now());
            }

            let claimed = match self.store.claim_next_job(self.worker_id).await {
                Ok(claimed) => claimed,
                Err(StoreError::StorageUnavailable(error)) => {
                    warn!(worker_id = self.worker_id, %error, "store unavailable, backing off");
                    self.sleep_unless_cancelled(self.config.idle_interval.0)
                        .await;
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            let Some(job) = claimed else {
                self.sleep_unless_cancelled(self.config.idle_interval.0)
                    .await;
                continue;
            };

            if let Err(error) = self.process(&job).await {
                match error {
                    WorkerError::Store(StoreError::StorageUnavailable(error)) => {
                        // The claimed row stays processing until a recovery
                        // pass; nothing else we can do from here.
                        warn!(
                            worker_id = self.worker_id,
                            job_id = %job.id,
                            %error,
                            "could not record job outcome, store unavailable"
                        );
                    }
                    error => return Err(error),
                }
            }

            self.sleep_unless_cancelled(self.config.inter_job_interval.0)
                .await;
        }

        info!(worker_id = self.worker_id, "worker exiting");

        Ok(())
    }

    /// Execute one claimed job and record its outcome.
    async fn process(&self, job: &Job) -> Result<(), WorkerError> {
        info!(
            worker_id = self.worker_id,
            job_id = %job.id,
            attempts = job.attempts,
            "running job"
        );

        let started = Instant::now();
        let run_result = self.runner.run(&job.command).await;
        let elapsed = started.elapsed().as_secs_f64();

        match run_result {
            Ok(output) if output.success() => {
                self.store.update_job_success(&job.id).await?;

                metrics::counter!("queuectl_jobs_completed").increment(1);
                metrics::histogram!("queuectl_job_processing_duration_seconds").record(elapsed);
                info!(worker_id = self.worker_id, job_id = %job.id, "job completed");

                Ok(())
            }
            Ok(output) => self.record_failure(job, failure_message(&output)).await,
            // The runner itself could not invoke the command; that still
            // counts as a failed attempt.
            Err(host_error) => self.record_failure(job, host_error.to_string()).await,
        }
    }

    async fn record_failure(&self, job: &Job, message: String) -> Result<(), WorkerError> {
        let backoff_base = self.backoff_base().await;

        let outcome = self
            .store
            .update_job_failure(
                &job.id,
                job.attempts,
                job.max_retries,
                backoff_base,
                &message,
            )
            .await?;

        match outcome {
            FailureOutcome::Retrying => {
                metrics::counter!("queuectl_jobs_retried").increment(1);
                warn!(
                    worker_id = self.worker_id,
                    job_id = %job.id,
                    error = %message,
                    "job failed, retry scheduled"
                );
            }
            FailureOutcome::Dead => {
                metrics::counter!("queuectl_jobs_dead_lettered").increment(1);
                error!(
                    worker_id = self.worker_id,
                    job_id = %job.id,
                    error = %message,
                    "job exhausted its retries, dead-lettered"
                );
            }
        }

        Ok(())
    }

    /// Read the backoff base fresh on every failure so `config set` takes
    /// effect on the next job.
    async fn backoff_base(&self) -> i64 {
        match self.store.get_config(store::BACKOFF_BASE_KEY).await {
            Ok(Some(value)) => value.parse().unwrap_or(DEFAULT_BACKOFF_BASE),
            Ok(None) => DEFAULT_BACKOFF_BASE,
            Err(error) => {
                warn!(worker_id = self.worker_id, %error, "could not read backoff_base");
                DEFAULT_BACKOFF_BASE
            }
        }
    }

    async fn sleep_unless_cancelled(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

/// Diagnostic for a nonzero exit: first non-empty of stderr, stdout, or the
/// bare exit code.
fn failure_message(output: &RunOutput) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();

    let message = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        return format!("exit={}", output.exit_code);
    };

    store::truncate_error(message, MAX_RUNNER_ERROR_CHARS)
}
