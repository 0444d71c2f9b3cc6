//! Live mapping of job id -> subscribed connections.
//!
//! Both directions are kept under one read-write lock: broadcasts take
//! snapshots under the read lock, connection lifecycle events take the
//! write lock. Empty entries are removed eagerly so memory tracks the number
//! of live subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use crate::notify::connection::{ConnectionHandle, ConnectionId};

#[derive(Default)]
struct Inner {
    by_job: HashMap<Uuid, HashMap<ConnectionId, ConnectionHandle>>,
    by_conn: HashMap<ConnectionId, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the pair was already registered.
    pub fn subscribe(&self, conn: &ConnectionHandle, job_id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let added = inner
            .by_job
            .entry(job_id)
            .or_default()
            .insert(conn.id(), conn.clone())
            .is_none();
        inner.by_conn.entry(conn.id()).or_default().insert(job_id);
        added
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, job_id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let removed = match inner.by_job.get_mut(&job_id) {
            Some(conns) => {
                let removed = conns.remove(&conn_id).is_some();
                if conns.is_empty() {
                    inner.by_job.remove(&job_id);
                }
                removed
            }
            None => false,
        };

        if let Some(jobs) = inner.by_conn.get_mut(&conn_id) {
            jobs.remove(&job_id);
            if jobs.is_empty() {
                inner.by_conn.remove(&conn_id);
            }
        }

        removed
    }

    /// Drop every subscription held by `conn_id`. Returns the job ids it left.
    pub fn unsubscribe_all(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let Some(jobs) = inner.by_conn.remove(&conn_id) else {
            return Vec::new();
        };

        for job_id in &jobs {
            if let Some(conns) = inner.by_job.get_mut(job_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_job.remove(job_id);
                }
            }
        }

        jobs.into_iter().collect()
    }

    /// Snapshot of the current subscribers of `job_id`.
    pub fn connections_for(&self, job_id: Uuid) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_job
            .get(&job_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn jobs_for(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_conn
            .get(&conn_id)
            .map(|jobs| jobs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_conn
            .len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_conn
            .values()
            .map(|jobs| jobs.len())
            .sum()
    }

    /// Number of job ids with at least one subscriber.
    pub fn job_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_job
            .len()
    }
}
