//! Queue client behavior against a live store.


use serde_json::json;

use conveyor::{JobOptions, JobState, KeepPolicy, QueueEvent, QueueEvents, QueueEventsOptions};
use test_harness::{destroy, redis_url, test_queue, wait_until};

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn add_places_jobs_by_options() {
    let queue = test_queue("placement").await;

    let plain = queue.add("plain", json!({"n": 1}), JobOptions::default()).await.unwrap();
    assert_eq!(queue.get_state(&plain.id).await.unwrap(), JobState::Waiting);

    let prioritized = queue
        .add(
            "prio",
            json!({}),
            JobOptions {
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        queue.get_state(&prioritized.id).await.unwrap(),
        JobState::Prioritized
    );

    let delayed = queue
        .add(
            "later",
            json!({}),
            JobOptions {
                delay: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(queue.get_state(&delayed.id).await.unwrap(), JobState::Delayed);

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.prioritized, 1);
    assert_eq!(counts.delayed, 1);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn duplicate_caller_supplied_id_is_idempotent() {
    let queue = test_queue("dup").await;
    let opts = JobOptions {
        job_id: Some("fixed".to_string()),
        ..Default::default()
    };

    let first = queue.add("one", json!({"v": 1}), opts.clone()).await.unwrap();
    let second = queue.add("two", json!({"v": 2}), opts).await.unwrap();
    assert_eq!(first.id, "fixed");
    assert_eq!(second.id, "fixed");

    // the second add must not have mutated anything
    let stored = queue.get_job("fixed").await.unwrap().unwrap();
    assert_eq!(stored.name, "one");
    assert_eq!(stored.data, json!({"v": 1}));
    assert_eq!(queue.get_job_counts().await.unwrap().waiting, 1);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn add_bulk_preserves_relative_order() {
    let queue = test_queue("bulk").await;
    let jobs = queue
        .add_bulk(
            (0..5)
                .map(|i| ("batch".to_string(), json!({"i": i}), JobOptions::default()))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(jobs.len(), 5);

    let waiting = queue.get_jobs_in(JobState::Waiting, 0, -1).await.unwrap();
    assert_eq!(waiting.len(), 5);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn pause_redirects_adds_and_resume_restores() {
    let queue = test_queue("pause").await;

    queue.add("before", json!({}), JobOptions::default()).await.unwrap();
    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());

    let during = queue.add("during", json!({}), JobOptions::default()).await.unwrap();
    assert_eq!(queue.get_state(&during.id).await.unwrap(), JobState::Paused);

    queue.resume().await.unwrap();
    assert!(!queue.is_paused().await.unwrap());
    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.paused, 0);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn promote_moves_a_delayed_job_to_wait() {
    let queue = test_queue("promote").await;
    let job = queue
        .add(
            "later",
            json!({}),
            JobOptions {
                delay: 600_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    queue.promote(&job.id).await.unwrap();
    assert_eq!(queue.get_state(&job.id).await.unwrap(), JobState::Waiting);

    // promoting twice is a state error
    assert!(queue.promote(&job.id).await.is_err());

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn remove_rejects_scheduler_owned_jobs() {
    let queue = test_queue("remove-sched").await;
    let occurrence = queue
        .add(
            "tick",
            json!({}),
            JobOptions {
                repeat: Some(conveyor::RepeatOptions {
                    every: Some(60_000),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = queue.remove(&occurrence.id).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "Job {} belongs to a job scheduler and cannot be removed directly. remove",
            occurrence.id
        )
    );

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn clean_drops_old_terminal_jobs() {
    let queue = test_queue("clean").await;
    let job = queue
        .add(
            "done",
            json!({}),
            JobOptions {
                remove_on_complete: KeepPolicy::Always(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // finish it through a worker
    let processor = std::sync::Arc::new(test_harness::RecordingProcessor::new());
    let worker = conveyor::Worker::new(
        &redis_url(),
        queue.name(),
        processor,
        conveyor::WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(5_000, || async {
            queue.get_state(&job.id).await.unwrap() == JobState::Completed
        })
        .await
    );
    worker.close(false).await;

    let removed = queue.clean(0, 100, JobState::Completed).await.unwrap();
    assert_eq!(removed, 1);
    assert!(queue.get_job(&job.id).await.unwrap().is_none());

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn events_observer_sees_lifecycle() {
    let queue = test_queue("events").await;
    let events = QueueEvents::new(
        &redis_url(),
        queue.name(),
        QueueEventsOptions::default(),
    )
    .await
    .unwrap();
    let mut sub = events.subscribe();

    // give the reader a moment to park on the stream tip
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let job = queue.add("evt", json!({}), JobOptions::default()).await.unwrap();

    let mut saw_added = false;
    let mut saw_waiting = false;
    for _ in 0..4 {
        match tokio::time::timeout(std::time::Duration::from_secs(5), sub.next()).await {
            Ok(Some((_, QueueEvent::Added { job_id, name }))) if job_id == job.id => {
                assert_eq!(name, "evt");
                saw_added = true;
            }
            Ok(Some((_, QueueEvent::Waiting { job_id, .. }))) if job_id == job.id => {
                saw_waiting = true;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
        if saw_added && saw_waiting {
            break;
        }
    }
    assert!(saw_added && saw_waiting);

    events.close().await;
    destroy(&queue).await;
}
