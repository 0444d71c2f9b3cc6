use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::jobs::executor::ExecutorConfig;
use crate::jobs::queue::QueueConfig;
use crate::jobs::retry::RetryConfig;

/// Runtime configuration, read once from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub worker_id: String,
    pub api_addr: Option<String>,
    pub poll_timeout: Duration,
    pub workers_per_type: usize,
    pub connection_buffer: usize,
    pub event_cache_capacity: usize,
    pub max_attempts: i32,
    pub max_payload_bytes: usize,
    pub migrate_on_startup: bool,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let worker_id = env_or_fallback("JOBFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let api_addr = match env_or_fallback("JOBFLOW_API_ADDR", "API_ADDR") {
            Some(s) => normalize_optional_addr(&s),
            None => Some("0.0.0.0:8080".to_string()),
        };

        let poll_timeout_ms = env_parse("JOBFLOW_POLL_TIMEOUT_MS")?.unwrap_or(5_000u64);
        if poll_timeout_ms == 0 {
            anyhow::bail!("JOBFLOW_POLL_TIMEOUT_MS must be > 0");
        }

        let workers_per_type = env_parse("JOBFLOW_WORKERS_PER_TYPE")?
            .unwrap_or(1usize)
            .clamp(1, 64);

        let connection_buffer = env_parse("JOBFLOW_CONNECTION_BUFFER")?
            .unwrap_or(32usize)
            .max(1);

        let event_cache_capacity =
            env_parse("JOBFLOW_EVENT_CACHE_CAPACITY")?.unwrap_or(10_000usize);

        let max_attempts = env_parse("JOBFLOW_MAX_ATTEMPTS")?.unwrap_or(1i32);
        if max_attempts <= 0 {
            anyhow::bail!("JOBFLOW_MAX_ATTEMPTS must be > 0");
        }

        let max_payload_bytes = env_or_fallback("JOBFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(256 * 1024);

        let migrate_on_startup = env_bool("JOBFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);
        let log_json = env_bool("JOBFLOW_LOG_JSON").unwrap_or(false);

        Ok(Self {
            database_url,
            worker_id,
            api_addr,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            workers_per_type,
            connection_buffer,
            event_cache_capacity,
            max_attempts,
            max_payload_bytes,
            migrate_on_startup,
            log_json,
        })
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue: QueueConfig {
                poll_timeout: self.poll_timeout,
                max_payload_bytes: self.max_payload_bytes,
            },
            default_max_attempts: self.max_attempts,
            connection_buffer: self.connection_buffer,
            event_cache_capacity: self.event_cache_capacity,
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            worker_id: self.worker_id.clone(),
            workers_per_type: self.workers_per_type,
            retry: RetryConfig::default(),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}")),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
