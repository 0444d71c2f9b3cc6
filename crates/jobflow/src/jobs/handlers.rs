use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use tokio::{sync::Semaphore, time::timeout};

use crate::jobs::error_codes::{ErrorCode, JobError};
use crate::jobs::model::Job;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
pub type HandlerResult = Result<Value, JobError>;
type HandlerFn = dyn for<'a> Fn(&'a Job) -> BoxFuture<'a, HandlerResult> + Send + Sync;

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

/// Table of job type -> handler, filled in before the executor starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: &str, handler: F)
    where
        F: for<'a> Fn(&'a Job) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a Job) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let replaced = self
            .handlers
            .insert(
                job_type.to_string(),
                HandlerEntry {
                    handler: Arc::new(handler),
                    semaphore,
                    timeout: opts.timeout,
                },
            )
            .is_some();
        if replaced {
            tracing::warn!(job_type, "handler replaced");
        }
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl HandlerEntry {
    pub async fn run(&self, job: &Job) -> HandlerResult {
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                JobError::new(ErrorCode::WorkerShutdown.as_str(), "handler semaphore closed")
            })?),
            None => None,
        };

        let fut = (self.handler)(job);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(JobError::new(
                    ErrorCode::Timeout.as_str(),
                    format!("handler timeout after {}ms", dur.as_millis()),
                )),
            },
            None => fut.await,
        }
    }
}

/// Decode a job payload into a handler's input type.
pub fn parse_payload<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| JobError::bad_payload(e.to_string()))
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::NewJob;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoPayload {
        n: u32,
    }

    #[tokio::test]
    async fn runs_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("echo", |job| {
            boxed(async move {
                let p: EchoPayload = parse_payload(job)?;
                Ok(json!(format!("{} words", p.n)))
            })
        });

        let job = Job::pending(NewJob::new("echo", json!({"n": 5})));
        let out = reg.handler_for("echo").unwrap().run(&job).await.unwrap();
        assert_eq!(out, json!("5 words"));
        assert!(reg.handler_for("nope").is_none());
        assert_eq!(reg.job_types(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn bad_payload_maps_to_code() {
        let mut reg = HandlerRegistry::new();
        reg.register("echo", |job| {
            boxed(async move {
                let p: EchoPayload = parse_payload(job)?;
                Ok(json!(p.n))
            })
        });

        let job = Job::pending(NewJob::new("echo", json!({"n": "five"})));
        let err = reg.handler_for("echo").unwrap().run(&job).await.unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
    }

    #[tokio::test]
    async fn timeout_becomes_job_error() {
        let mut reg = HandlerRegistry::new();
        reg.register_with_options(
            "slow",
            |_job| {
                boxed(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                })
            },
            HandlerOptions::new().timeout(Duration::from_millis(20)),
        );

        let job = Job::pending(NewJob::new("slow", json!({})));
        let err = reg.handler_for("slow").unwrap().run(&job).await.unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
    }
}
