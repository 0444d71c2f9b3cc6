use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::model::{Job, JobResult, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("job {0} not found")]
    UnknownJob(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Keyed storage for job records and their latest result.
///
/// The store is the writer-of-record: the queue writes the Pending row,
/// every later transition is written by the executor.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn put_result(&self, result: &JobResult) -> Result<(), StoreError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<JobResult>, StoreError>;

    /// Jobs of one type, oldest first, optionally narrowed to one status.
    async fn list_by_type(
        &self,
        job_type: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    results: RwLock<HashMap<Uuid, JobResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::UnknownJob(job.id)),
        }
    }

    async fn put_result(&self, result: &JobResult) -> Result<(), StoreError> {
        self.results
            .write()
            .await
            .insert(result.job_id, result.clone());
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<JobResult>, StoreError> {
        Ok(self.results.read().await.get(&id).cloned())
    }

    async fn list_by_type(
        &self,
        job_type: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .filter(|j| status.map_or(true, |st| j.status == st))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(JobStatus::ALL
            .iter()
            .map(|st| (*st, counts.get(st).copied().unwrap_or(0)))
            .collect())
    }
}
