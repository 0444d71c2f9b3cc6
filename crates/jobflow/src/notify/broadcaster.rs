//! Fan-out of [`StatusEvent`]s to the connections subscribed to a job.
//!
//! The latest event of every job is cached for replay. Publishing and
//! registering a newcomer for the same job id serialise on a per-job slot,
//! so a newcomer sees either the live send or the replay of an event, never
//! both, and events of one job reach a connection in publish order.
//!
//! Only publishing creates a slot. Jobs whose latest event is terminal are
//! remembered oldest first and dropped once there are more than `capacity`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::JobStatus;
use crate::notify::connection::{ConnectionHandle, DeliveryError};
use crate::notify::event::StatusEvent;
use crate::notify::registry::SubscriptionRegistry;

type Slot = Arc<Mutex<Option<Arc<StatusEvent>>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Cache {
    slots: HashMap<Uuid, Slot>,
    settled: VecDeque<Uuid>,
}

pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    cache: Mutex<Cache>,
    capacity: usize,

    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self::with_capacity(registry, usize::MAX)
    }

    pub fn with_capacity(registry: Arc<SubscriptionRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            cache: Mutex::new(Cache::default()),
            capacity,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, job_id: Uuid) -> Slot {
        self.cache().slots.entry(job_id).or_default().clone()
    }

    /// Remember that `job_id` settled and drop the oldest settled entries
    /// beyond capacity. A slot that is busy or no longer terminal is kept.
    fn settle(&self, job_id: Uuid) {
        let mut cache = self.cache();
        cache.settled.push_back(job_id);

        while cache.settled.len() > self.capacity {
            let Some(oldest) = cache.settled.pop_front() else {
                break;
            };
            let evictable = cache.slots.get(&oldest).is_some_and(|slot| {
                slot.try_lock()
                    .map(|latest| latest.as_ref().map_or(true, |ev| ev.status.is_terminal()))
                    .unwrap_or(false)
            });
            if evictable {
                cache.slots.remove(&oldest);
            }
        }
    }

    /// Record `status` as the latest for `job_id` and push it to every
    /// current subscriber. Never blocks on a slow connection: a connection
    /// that cannot take the event is unsubscribed everywhere and closed.
    ///
    /// Returns the number of connections the event was handed to.
    pub fn publish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> usize {
        let event = Arc::new(
            StatusEvent::new(job_id, status)
                .with_result(result)
                .with_error(error),
        );

        let slot = self.slot(job_id);
        let mut latest = slot.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = Some(event.clone());
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for conn in self.registry.connections_for(job_id) {
            match conn.try_deliver(&event) {
                Ok(()) => delivered += 1,
                Err(e) => self.evict(&conn, job_id, e),
            }
        }
        drop(latest);

        if status.is_terminal() {
            self.settle(job_id);
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::debug!(job_id = %job_id, status = %status, delivered, "status published");
        delivered
    }

    /// Subscribe `conn` to `job_id` and replay the cached latest event to it.
    ///
    /// Returns `true` if a cached event was delivered.
    pub fn on_connect(&self, conn: &ConnectionHandle, job_id: Uuid) -> bool {
        let slot = {
            let cache = self.cache();
            match cache.slots.get(&job_id) {
                Some(slot) => slot.clone(),
                None => {
                    // a publish has to take the cache lock to create the slot,
                    // so it will see this subscription
                    self.registry.subscribe(conn, job_id);
                    return false;
                }
            }
        };
        let latest = slot.lock().unwrap_or_else(PoisonError::into_inner);

        self.registry.subscribe(conn, job_id);

        let Some(event) = latest.as_ref() else {
            return false;
        };

        match conn.try_deliver(event) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.evict(conn, job_id, e);
                false
            }
        }
    }

    fn evict(&self, conn: &ConnectionHandle, job_id: Uuid, err: DeliveryError) {
        let left = self.registry.unsubscribe_all(conn.id());
        self.dropped.fetch_add(1, Ordering::Relaxed);
        conn.close();
        tracing::warn!(
            conn_id = %conn.id(),
            job_id = %job_id,
            error = %err,
            subscriptions_removed = left.len(),
            "delivery failed, connection dropped"
        );
    }

    pub fn latest(&self, job_id: Uuid) -> Option<Arc<StatusEvent>> {
        let slot = self.cache().slots.get(&job_id).cloned()?;
        let latest = slot.lock().unwrap_or_else(PoisonError::into_inner);
        latest.clone()
    }

    /// Drop the cached event for `job_id`.
    pub fn forget(&self, job_id: Uuid) -> bool {
        self.cache().slots.remove(&job_id).is_some()
    }

    /// Number of jobs with a cached event.
    pub fn cached_jobs(&self) -> usize {
        self.cache().slots.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Arc::new(SubscriptionRegistry::new()))
    }

    #[test]
    fn publish_reaches_only_subscribers_of_that_job() {
        let b = broadcaster();
        let (a, mut ra) = ConnectionHandle::channel(4);
        let (c, mut rc) = ConnectionHandle::channel(4);
        let j1 = Uuid::new_v4();
        let j2 = Uuid::new_v4();

        b.on_connect(&a, j1);
        b.on_connect(&c, j2);

        assert_eq!(b.publish(j1, JobStatus::Completed, Some(json!(1)), None), 1);

        let got = ra.try_recv().unwrap();
        assert_eq!(got.job_id, j1);
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn late_subscriber_gets_replay_once() {
        let b = broadcaster();
        let job = Uuid::new_v4();
        b.publish(job, JobStatus::Completed, Some(json!("done")), None);

        let (conn, mut rx) = ConnectionHandle::channel(4);
        assert!(b.on_connect(&conn, job));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.status, JobStatus::Completed);
        assert_eq!(ev.result, Some(json!("done")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_buffer_evicts_connection() {
        let b = broadcaster();
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (slow, _rx) = ConnectionHandle::channel(1);
        b.on_connect(&slow, job);
        b.on_connect(&slow, other);

        assert_eq!(b.publish(job, JobStatus::Processing, None, None), 1);
        assert_eq!(b.publish(job, JobStatus::Completed, None, None), 0);

        assert!(b.registry().connections_for(job).is_empty());
        assert!(b.registry().connections_for(other).is_empty());
        assert!(slow.is_closed());
        assert_eq!(b.stats().dropped, 1);
    }

    #[test]
    fn dead_connection_is_removed_without_panicking() {
        let b = broadcaster();
        let job = Uuid::new_v4();
        let (dead, rx) = ConnectionHandle::channel(4);
        let (live, mut live_rx) = ConnectionHandle::channel(4);
        b.on_connect(&dead, job);
        b.on_connect(&live, job);
        drop(rx);

        assert_eq!(b.publish(job, JobStatus::Failed, None, Some("boom".into())), 1);
        assert_eq!(live_rx.try_recv().unwrap().error.as_deref(), Some("boom"));
        assert_eq!(b.registry().connections_for(job).len(), 1);
    }

    #[test]
    fn subscribing_to_unknown_jobs_caches_nothing() {
        let b = broadcaster();
        let (conn, _rx) = ConnectionHandle::channel(4);
        for _ in 0..1_000 {
            assert!(!b.on_connect(&conn, Uuid::new_v4()));
        }
        assert_eq!(b.cached_jobs(), 0);
        assert_eq!(b.registry().jobs_for(conn.id()).len(), 1_000);

        b.registry().unsubscribe_all(conn.id());
        assert_eq!(b.cached_jobs(), 0);
        assert_eq!(b.registry().subscription_count(), 0);
    }

    #[test]
    fn subscriber_registered_before_first_publish_gets_it_live() {
        let b = broadcaster();
        let job = Uuid::new_v4();
        let (conn, mut rx) = ConnectionHandle::channel(4);
        assert!(!b.on_connect(&conn, job));

        assert_eq!(b.publish(job, JobStatus::Processing, None, None), 1);
        assert_eq!(rx.try_recv().unwrap().status, JobStatus::Processing);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn settled_events_beyond_capacity_are_dropped_oldest_first() {
        let b = Broadcaster::with_capacity(Arc::new(SubscriptionRegistry::new()), 2);
        let running = Uuid::new_v4();
        b.publish(running, JobStatus::Processing, None, None);

        let done: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &done {
            b.publish(*id, JobStatus::Completed, Some(json!(1)), None);
        }

        assert!(b.latest(done[0]).is_none());
        assert!(b.latest(done[1]).is_some());
        assert!(b.latest(done[2]).is_some());
        assert_eq!(b.latest(running).unwrap().status, JobStatus::Processing);
        assert_eq!(b.cached_jobs(), 3);
    }

    #[test]
    fn latest_overwrites_and_forget_clears() {
        let b = broadcaster();
        let job = Uuid::new_v4();
        b.publish(job, JobStatus::Processing, None, None);
        b.publish(job, JobStatus::Completed, Some(json!(3)), None);

        assert_eq!(b.latest(job).unwrap().status, JobStatus::Completed);
        assert!(b.forget(job));
        assert!(b.latest(job).is_none());
    }
}
