use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::model::{Job, JobResult, JobStatus, NewJob};
use crate::jobs::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("job_type is required")]
    InvalidType,

    #[error("no handler registered for job_type={0}")]
    UnknownType(String),

    #[error("payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("failed to persist job: {0}")]
    Store(#[from] StoreError),
}

/// Answer to a result lookup. `Pending` covers every non-terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    NotFound,
    Pending(JobStatus),
    Ready(JobResult),
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Upper bound on one `dequeue` wait.
    pub poll_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            max_payload_bytes: 256 * 1024,
        }
    }
}

#[derive(Default)]
struct LaneState {
    ids: VecDeque<Uuid>,
    queued: HashSet<Uuid>,
}

/// FIFO of job ids for one job type.
#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    fn push_back(&self, id: Uuid) -> bool {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !st.queued.insert(id) {
            return false;
        }
        st.ids.push_back(id);
        drop(st);
        self.notify.notify_one();
        true
    }

    fn push_front(&self, id: Uuid) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.queued.insert(id) {
            st.ids.push_front(id);
        }
        drop(st);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Uuid> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = st.ids.pop_front()?;
        st.queued.remove(&id);
        Some(id)
    }

    fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }
}

/// Per-type hand-off of pending jobs from producers to worker loops.
///
/// The job record is written to the store before its id becomes visible in a
/// lane, so an id handed out by [`WorkQueue::dequeue`] always resolves.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn JobStore>,
    lanes: Arc<RwLock<HashMap<String, Arc<Lane>>>>,
    cfg: QueueConfig,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn JobStore>, cfg: QueueConfig) -> Self {
        Self {
            store,
            lanes: Arc::new(RwLock::new(HashMap::new())),
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    fn lane(&self, job_type: &str) -> Arc<Lane> {
        if let Some(lane) = self
            .lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
        {
            return lane.clone();
        }

        self.lanes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_type.to_string())
            .or_default()
            .clone()
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(&self, job_type: &str, payload: Value) -> Result<Uuid, EnqueueError> {
        self.enqueue_with(NewJob::new(job_type, payload)).await
    }

    pub async fn enqueue_with(&self, new: NewJob) -> Result<Uuid, EnqueueError> {
        if new.job_type.trim().is_empty() {
            return Err(EnqueueError::InvalidType);
        }

        let size = serde_json::to_vec(&new.payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if size > self.cfg.max_payload_bytes {
            return Err(EnqueueError::PayloadTooLarge {
                size,
                max: self.cfg.max_payload_bytes,
            });
        }

        let job = Job::pending(new);
        self.store.insert_job(&job).await?;
        self.lane(&job.job_type).push_back(job.id);

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job.id)
    }

    /// Make an already-stored job visible to workers again.
    pub fn requeue(&self, job: &Job) -> bool {
        self.lane(&job.job_type).push_back(job.id)
    }

    // ----------------------------
    // Dequeue
    // ----------------------------

    /// Wait up to `poll_timeout` for the next runnable job of `job_type`.
    ///
    /// Returns `Ok(None)` on timeout or cancellation. Popping the id from the
    /// lane is the only claim; a popped id is never handed to a second caller.
    pub async fn dequeue(
        &self,
        job_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, StoreError> {
        let lane = self.lane(job_type);
        let deadline = Instant::now() + self.cfg.poll_timeout;

        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(id) = lane.pop() {
                let job = match self.store.get_job(id).await {
                    Ok(job) => job,
                    Err(e) => {
                        lane.push_front(id);
                        return Err(e);
                    }
                };

                match job {
                    Some(job) if job.status.is_dequeueable() => return Ok(Some(job)),
                    Some(job) => {
                        tracing::debug!(job_id = %id, status = %job.status, "skipping non-runnable job");
                    }
                    None => {
                        tracing::warn!(job_id = %id, "queued job missing from store");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultLookup, StoreError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(ResultLookup::NotFound);
        };

        if job.status.is_terminal() {
            if let Some(result) = self.store.get_result(job_id).await? {
                return Ok(ResultLookup::Ready(result));
            }
        }

        Ok(ResultLookup::Pending(job.status))
    }

    pub fn depth(&self, job_type: &str) -> usize {
        self.lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn depths(&self) -> Vec<(String, usize)> {
        let lanes = self.lanes.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(String, usize)> =
            lanes.iter().map(|(k, l)| (k.clone(), l.len())).collect();
        out.sort();
        out
    }

    // ----------------------------
    // Recovery
    // ----------------------------

    /// Re-populate lanes from the store after a restart.
    ///
    /// Jobs left in Processing by a dead process move to Retrying; every
    /// Pending and Retrying job is appended again, oldest first. Must run
    /// before any worker loop starts.
    pub async fn recover(&self, job_types: &[String]) -> Result<usize, StoreError> {
        let mut requeued = 0;

        for job_type in job_types {
            for mut job in self
                .store
                .list_by_type(job_type, Some(JobStatus::Processing))
                .await?
            {
                job.status = JobStatus::Retrying;
                job.updated_at = Utc::now();
                self.store.update_job(&job).await?;
                tracing::warn!(job_id = %job.id, job_type = %job_type, "orphaned job marked retrying");
            }

            for job in self.store.list_by_type(job_type, None).await? {
                if job.status.is_dequeueable() && self.requeue(&job) {
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            tracing::info!(requeued, "recovered queued jobs");
        }
        Ok(requeued)
    }
}
