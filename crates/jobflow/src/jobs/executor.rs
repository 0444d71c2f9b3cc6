use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::error_codes::{ErrorCode, JobError};
use crate::jobs::handlers::HandlerRegistry;
use crate::jobs::model::{Job, JobResult, JobStatus};
use crate::jobs::queue::WorkQueue;
use crate::jobs::retry::{next_delay, should_retry, RetryConfig};
use crate::jobs::store::StoreError;
use crate::notify::broadcaster::Broadcaster;

/// Pause after a store error before the loop dequeues again.
const ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Writes of a finished attempt are retried this many times in total.
const COMMIT_ATTEMPTS: i32 = 4;

const COMMIT_BACKOFF: RetryConfig = RetryConfig {
    base: Duration::from_millis(50),
    max: Duration::from_secs(1),
    jitter_pct: 0.2,
};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

fn advance(job: &mut Job, next: JobStatus) -> Result<(), ExecError> {
    if !job.status.can_transition_to(next) {
        return Err(ExecError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to: next,
        });
    }
    job.status = next;
    job.updated_at = Utc::now();
    Ok(())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub workers_per_type: usize,
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            workers_per_type: 1,
            retry: RetryConfig::default(),
        }
    }
}

/// Runs the pull loops and owns every status transition after enqueue.
#[derive(Clone)]
pub struct Executor {
    queue: WorkQueue,
    broadcaster: Arc<Broadcaster>,
    handlers: Arc<HandlerRegistry>,
    cfg: ExecutorConfig,
}

impl Executor {
    pub fn new(
        queue: WorkQueue,
        broadcaster: Arc<Broadcaster>,
        handlers: Arc<HandlerRegistry>,
        cfg: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            broadcaster,
            handlers,
            cfg,
        }
    }

    pub fn job_types(&self) -> Vec<String> {
        self.handlers.job_types()
    }

    /// Run one pull loop per registered type (times `workers_per_type`)
    /// until `cancel` fires. Loops stop dequeuing promptly on cancellation;
    /// a job already handed to a handler is finished and recorded first.
    pub async fn run(self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for job_type in self.handlers.job_types() {
            for slot in 0..self.cfg.workers_per_type.max(1) {
                let this = self.clone();
                let cancel = cancel.clone();
                let job_type = job_type.clone();
                loops.spawn(async move { this.worker_loop(job_type, slot, cancel).await });
            }
        }

        tracing::info!(
            worker_id = %self.cfg.worker_id,
            loops = loops.len(),
            "executor started"
        );

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker loop aborted");
            }
        }

        tracing::info!(worker_id = %self.cfg.worker_id, "executor stopped");
    }

    async fn worker_loop(&self, job_type: String, slot: usize, cancel: CancellationToken) {
        tracing::debug!(job_type = %job_type, slot, "worker loop started");

        while !cancel.is_cancelled() {
            match self.queue.dequeue(&job_type, &cancel).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_one(job).await {
                        tracing::error!(job_type = %job_type, error = %e, "job processing failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_type = %job_type, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::debug!(job_type = %job_type, slot, "worker loop stopped");
    }

    /// Drive one dequeued job through Processing to its outcome.
    ///
    /// Returns the last status committed to the store. Each committed
    /// transition is published exactly once. A job that is not Pending or
    /// Retrying is refused without running its handler.
    ///
    /// If the outcome cannot be written even after a few tries, a Failed
    /// event carrying the store error is published so subscribers are not
    /// left waiting; the stored record stays Processing until `recover`.
    pub async fn process_one(&self, mut job: Job) -> Result<JobStatus, ExecError> {
        let store = self.queue.store().clone();

        advance(&mut job, JobStatus::Processing)?;
        job.attempts += 1;
        if let Err(e) = store.update_job(&job).await {
            // still Pending/Retrying in the store; hand it back
            self.queue.requeue(&job);
            return Err(e.into());
        }
        self.broadcaster
            .publish(job.id, JobStatus::Processing, None, None);

        let start = Instant::now();
        let outcome = self.invoke(&job).await;
        let latency_ms = millis(start.elapsed());

        match outcome {
            Ok(value) => {
                let result = JobResult::completed(job.id, value.clone());
                if let Err(e) = self.commit(&mut job, JobStatus::Completed, &result).await {
                    return Err(self.abandon(&job, e));
                }
                self.broadcaster
                    .publish(job.id, JobStatus::Completed, Some(value), None);

                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    latency_ms,
                    "job completed"
                );
                Ok(JobStatus::Completed)
            }
            Err(err) => {
                let result = JobResult::failed(job.id, err.message.clone());
                if let Err(e) = self.commit(&mut job, JobStatus::Failed, &result).await {
                    return Err(self.abandon(&job, e));
                }
                self.broadcaster.publish(
                    job.id,
                    JobStatus::Failed,
                    None,
                    Some(err.message.clone()),
                );

                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    code = err.code,
                    error = %err.message,
                    latency_ms,
                    "job failed"
                );

                if should_retry(&job, &err) {
                    self.schedule_retry(job, err).await
                } else {
                    Ok(JobStatus::Failed)
                }
            }
        }
    }

    async fn invoke(&self, job: &Job) -> Result<Value, JobError> {
        let Some(entry) = self.handlers.handler_for(&job.job_type) else {
            return Err(JobError::new(
                ErrorCode::UnknownJobType.as_str(),
                format!("no handler for job_type={}", job.job_type),
            ));
        };

        // Own task so a panicking handler cannot take the loop down.
        let owned = job.clone();
        let handle = tokio::spawn(async move { entry.run(&owned).await });

        match handle.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(JobError::new(ErrorCode::Panic.as_str(), msg))
            }
            Err(e) => Err(JobError::new(
                ErrorCode::WorkerShutdown.as_str(),
                e.to_string(),
            )),
        }
    }

    /// Result first, then status, so a terminal status always has a result.
    /// Store errors are retried with a short backoff.
    async fn commit(
        &self,
        job: &mut Job,
        status: JobStatus,
        result: &JobResult,
    ) -> Result<(), ExecError> {
        advance(job, status)?;

        let store = self.queue.store();
        let mut rng = StdRng::from_entropy();
        let mut attempt = 1;
        loop {
            let written = match store.put_result(result).await {
                Ok(()) => store.update_job(job).await,
                Err(e) => Err(e),
            };

            match written {
                Ok(()) => return Ok(()),
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    let delay = next_delay(attempt, &COMMIT_BACKOFF, &mut rng);
                    tracing::warn!(
                        job_id = %job.id,
                        status = %status,
                        attempt,
                        delay_ms = millis(delay),
                        error = %e,
                        "failed to record job outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn abandon(&self, job: &Job, err: ExecError) -> ExecError {
        tracing::error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            error = %err,
            "giving up on recording job outcome"
        );
        self.broadcaster.publish(
            job.id,
            JobStatus::Failed,
            None,
            Some(format!("failed to record outcome: {err}")),
        );
        err
    }

    async fn schedule_retry(&self, mut job: Job, err: JobError) -> Result<JobStatus, ExecError> {
        advance(&mut job, JobStatus::Retrying)?;
        // on error the job simply stays Failed
        self.queue.store().update_job(&job).await?;
        self.broadcaster
            .publish(job.id, JobStatus::Retrying, None, Some(err.message));

        let mut rng = StdRng::from_entropy();
        let delay = next_delay(job.attempts, &self.cfg.retry, &mut rng);

        tracing::info!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = millis(delay),
            "job scheduled for retry"
        );

        if delay.is_zero() {
            self.queue.requeue(&job);
        } else {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(&job);
            });
        }

        Ok(JobStatus::Retrying)
    }
}
