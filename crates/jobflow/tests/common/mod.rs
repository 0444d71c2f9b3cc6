#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow::jobs::{
    boxed, parse_payload, HandlerRegistry, Job, JobError, JobResult, JobStatus, JobStore,
    MemoryStore, QueueConfig, ResultLookup, StoreError,
};
use jobflow::notify::{EventReceiver, StatusEvent};
use jobflow::{Dispatcher, DispatcherConfig};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

/// Postgres pool for store tests, or `None` when `TEST_DATABASE_URL` is unset.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobflow_results, jobflow_jobs CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn config() -> DispatcherConfig {
    DispatcherConfig {
        queue: QueueConfig {
            poll_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        },
        default_max_attempts: 1,
        connection_buffer: 32,
        event_cache_capacity: 1_000,
    }
}

pub fn dispatcher() -> Dispatcher {
    Dispatcher::new(Arc::new(MemoryStore::new()), config())
}

#[derive(Deserialize)]
struct EchoPayload {
    n: u64,
}

/// `echo` answers "<n> words"; `boom` always fails with "boom".
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", |job| {
        boxed(async move {
            let payload: EchoPayload = parse_payload(job)?;
            Ok(Value::String(format!("{} words", payload.n)))
        })
    });
    registry.register("boom", |_job| boxed(async move { Err(JobError::msg("boom")) }));
    registry
}

/// Handler that fails its first `failures` calls, then succeeds.
pub fn register_flaky(registry: &mut HandlerRegistry, job_type: &str, failures: usize) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.register(job_type, move |_job| {
        let counter = counter.clone();
        boxed(async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(JobError::msg(format!("flaky failure {}", n + 1)))
            } else {
                Ok(Value::String("recovered".into()))
            }
        })
    });
    calls
}

pub async fn next_event(rx: &mut EventReceiver) -> Arc<StatusEvent> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
}

/// Read events until one with `status` arrives; returns everything read.
pub async fn events_until(rx: &mut EventReceiver, status: JobStatus) -> Vec<Arc<StatusEvent>> {
    let mut seen = Vec::new();
    loop {
        let ev = next_event(rx).await;
        let done = ev.status == status;
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

pub async fn wait_for_result(dispatcher: &Dispatcher, id: Uuid) -> ResultLookup {
    tokio::time::timeout(WAIT, async {
        loop {
            match dispatcher.get_result(id).await.unwrap() {
                ResultLookup::Pending(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                other => return other,
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

/// In-memory store whose next `failures` result writes fail.
#[derive(Default)]
pub struct FlakyResults {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyResults {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyResults {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.update_job(job).await
    }

    async fn put_result(&self, result: &JobResult) -> Result<(), StoreError> {
        let left = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            return Err(StoreError::Corrupt("results table unavailable".into()));
        }
        self.inner.put_result(result).await
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<JobResult>, StoreError> {
        self.inner.get_result(id).await
    }

    async fn list_by_type(
        &self,
        job_type: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_by_type(job_type, status).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        self.inner.count_by_status().await
    }
}
