mod common;

use std::collections::HashSet;

use jobflow::jobs::{JobStatus, ResultLookup};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_single_consumer_sees_each_job_once() {
    let d = common::dispatcher();

    let mut producers = Vec::new();
    for p in 0..8 {
        let d = d.clone();
        producers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..25 {
                ids.push(d.enqueue("echo", json!({"n": p * 100 + i})).await.unwrap());
            }
            ids
        }));
    }

    let mut enqueued = HashSet::new();
    for p in producers {
        enqueued.extend(p.await.unwrap());
    }
    assert_eq!(enqueued.len(), 200);

    let cancel = CancellationToken::new();
    let mut seen = HashSet::new();
    while let Some(job) = d.queue().dequeue("echo", &cancel).await.unwrap() {
        assert_eq!(job.status, JobStatus::Pending);
        assert!(seen.insert(job.id), "job {} handed out twice", job.id);
    }

    assert_eq!(seen, enqueued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_consumers_never_share_a_job() {
    let d = common::dispatcher();
    for i in 0..100 {
        d.enqueue("echo", json!({"n": i})).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let mut consumers = Vec::new();
    for _ in 0..4 {
        let q = d.queue().clone();
        let cancel = cancel.clone();
        consumers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = q.dequeue("echo", &cancel).await.unwrap() {
                got.push(job.id);
            }
            got
        }));
    }

    let mut all: Vec<Uuid> = Vec::new();
    for c in consumers {
        all.extend(c.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
}

#[tokio::test]
async fn waiting_consumer_wakes_on_enqueue() {
    let d = common::dispatcher();
    let q = d.queue().clone();
    let cancel = CancellationToken::new();

    // poll timeout in tests is short, so keep asking until the job shows up
    let waiter = tokio::spawn(async move {
        loop {
            if let Some(job) = q.dequeue("echo", &cancel).await.unwrap() {
                return job.id;
            }
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let id = d.enqueue("echo", json!({"n": 1})).await.unwrap();

    let got = tokio::time::timeout(common::WAIT, waiter)
        .await
        .expect("consumer never woke")
        .unwrap();
    assert_eq!(got, id);
}

#[tokio::test]
async fn unknown_id_is_not_found_and_new_job_is_pending() {
    let d = common::dispatcher();

    assert_eq!(
        d.get_result(Uuid::new_v4()).await.unwrap(),
        ResultLookup::NotFound
    );

    let id = d.enqueue("echo", json!({"n": 1})).await.unwrap();
    assert_eq!(
        d.get_result(id).await.unwrap(),
        ResultLookup::Pending(JobStatus::Pending)
    );
}

#[tokio::test]
async fn enqueue_persists_before_returning() {
    let d = common::dispatcher();
    let id = d.enqueue("echo", json!({"n": 3})).await.unwrap();

    let job = d.store().get_job(id).await.unwrap().expect("stored");
    assert_eq!(job.job_type, "echo");
    assert_eq!(job.payload, json!({"n": 3}));
    assert_eq!(job.attempts, 0);
    assert_eq!(d.queue().depth("echo"), 1);
}
