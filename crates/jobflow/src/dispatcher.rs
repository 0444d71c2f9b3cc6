use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use uuid::Uuid;

use crate::jobs::executor::{Executor, ExecutorConfig};
use crate::jobs::handlers::HandlerRegistry;
use crate::jobs::model::{JobStatus, NewJob};
use crate::jobs::queue::{EnqueueError, QueueConfig, ResultLookup, WorkQueue};
use crate::jobs::store::{JobStore, StoreError};
use crate::notify::broadcaster::{BroadcastStats, Broadcaster};
use crate::notify::connection::{ConnectionHandle, ConnectionId, EventReceiver};
use crate::notify::registry::SubscriptionRegistry;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub queue: QueueConfig,
    /// Retry budget given to jobs enqueued without one.
    pub default_max_attempts: i32,
    /// Outbound buffer per connection, in events.
    pub connection_buffer: usize,
    /// Jobs whose latest cached event is terminal, kept for replay.
    pub event_cache_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            default_max_attempts: 1,
            connection_buffer: 32,
            event_cache_capacity: 10_000,
        }
    }
}

/// Entry point for producers, result readers and live sessions.
#[derive(Clone)]
pub struct Dispatcher {
    queue: WorkQueue,
    broadcaster: Arc<Broadcaster>,
    registry: Arc<SubscriptionRegistry>,
    /// `None` until an executor is built; then only handled types are accepted.
    job_types: Arc<RwLock<Option<HashSet<String>>>>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, cfg: DispatcherConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::with_capacity(
            registry.clone(),
            cfg.event_cache_capacity,
        ));
        Self {
            queue: WorkQueue::new(store, cfg.queue.clone()),
            broadcaster,
            registry,
            job_types: Arc::new(RwLock::new(None)),
            cfg,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.queue.store()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// Build an executor for `handlers`. From then on `enqueue` rejects job
    /// types that no executor of this dispatcher handles.
    pub fn executor(&self, handlers: HandlerRegistry, cfg: ExecutorConfig) -> Executor {
        self.accept_types(handlers.job_types());
        Executor::new(
            self.queue.clone(),
            self.broadcaster.clone(),
            Arc::new(handlers),
            cfg,
        )
    }

    // ----------------------------
    // Producers / readers
    // ----------------------------

    pub async fn enqueue(&self, job_type: &str, payload: Value) -> Result<Uuid, EnqueueError> {
        self.enqueue_with(
            NewJob::new(job_type, payload).max_attempts(self.cfg.default_max_attempts),
        )
        .await
    }

    pub async fn enqueue_with(&self, new: NewJob) -> Result<Uuid, EnqueueError> {
        if !new.job_type.trim().is_empty() && !self.accepts(&new.job_type) {
            return Err(EnqueueError::UnknownType(new.job_type));
        }
        self.queue.enqueue_with(new).await
    }

    pub fn accept_types(&self, job_types: impl IntoIterator<Item = String>) {
        let mut known = self.job_types.write().unwrap_or_else(PoisonError::into_inner);
        known.get_or_insert_with(HashSet::new).extend(job_types);
    }

    pub fn accepts(&self, job_type: &str) -> bool {
        match &*self.job_types.read().unwrap_or_else(PoisonError::into_inner) {
            Some(known) => known.contains(job_type),
            None => true,
        }
    }

    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultLookup, StoreError> {
        self.queue.get_result(job_id).await
    }

    pub async fn recover(&self, job_types: &[String]) -> Result<usize, StoreError> {
        self.queue.recover(job_types).await
    }

    // ----------------------------
    // Live sessions
    // ----------------------------

    /// Session with no subscriptions yet.
    pub fn open(&self) -> (ConnectionHandle, EventReceiver) {
        let (conn, rx) = ConnectionHandle::channel(self.cfg.connection_buffer);
        tracing::debug!(conn_id = %conn.id(), "connection opened");
        (conn, rx)
    }

    /// Open a session subscribed to `job_id`. The latest known status of the
    /// job, if any, is already waiting in the receiver.
    pub fn connect(&self, job_id: Uuid) -> (ConnectionHandle, EventReceiver) {
        let (conn, rx) = self.open();
        self.subscribe(&conn, job_id);
        (conn, rx)
    }

    /// Returns `true` if a cached status was replayed.
    pub fn subscribe(&self, conn: &ConnectionHandle, job_id: Uuid) -> bool {
        self.broadcaster.on_connect(conn, job_id)
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, job_id: Uuid) -> bool {
        self.registry.unsubscribe(conn_id, job_id)
    }

    pub fn disconnect(&self, conn_id: ConnectionId) {
        let left = self.registry.unsubscribe_all(conn_id);
        tracing::debug!(conn_id = %conn_id, subscriptions = left.len(), "connection closed");
    }

    // ----------------------------
    // Introspection
    // ----------------------------

    pub async fn status_counts(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        self.store().count_by_status().await
    }

    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.queue.depths()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    pub fn latest_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.broadcaster.latest(job_id).map(|ev| ev.status)
    }
}
