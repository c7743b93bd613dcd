//! Worker runtime behavior against a live store.


use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;

use conveyor::{
    BackoffKind, BackoffOptions, JobOptions, JobState, RateLimiterOptions, Worker,
    WorkerOptions,
};
use conveyor::options::BackoffStrategyOptions;
use test_harness::{
    destroy, redis_url, test_queue, wait_until, HangingProcessor, RecordingProcessor,
};

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn processes_a_job_to_completion() {
    let queue = test_queue("complete").await;
    let job = queue.add("work", json!({"x": 1}), JobOptions::default()).await.unwrap();

    let processor = Arc::new(RecordingProcessor::new());
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(5_000, || async {
            queue.get_state(&job.id).await.unwrap() == JobState::Completed
        })
        .await
    );
    let done = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.returnvalue, Some(json!({"ok": true})));
    assert_eq!(done.attempts_started, 1);
    assert!(done.processed_on.unwrap() <= done.finished_on.unwrap());

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn delayed_jobs_dispatch_in_enqueue_order() {
    let queue = test_queue("delayed-fifo").await;
    let base = Utc::now().timestamp_millis();

    // same timestamp and delay for every job: ordering must come from the
    // enqueue sequence alone
    let mut ids = Vec::new();
    for i in 0..43 {
        let job = queue
            .add(
                "ordered",
                json!({"i": i}),
                JobOptions {
                    delay: 1_000,
                    timestamp: Some(base),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ids.push(job.id);
    }

    let processor = Arc::new(RecordingProcessor::new());
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(20_000, || async { processor.processed_ids().len() == 43 }).await
    );
    assert_eq!(processor.processed_ids(), ids);

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn priority_dispatch_order() {
    let queue = test_queue("priority").await;
    queue.pause().await.unwrap();

    let low = queue
        .add("low", json!({}), JobOptions { priority: 10, ..Default::default() })
        .await
        .unwrap();
    let high = queue
        .add("high", json!({}), JobOptions { priority: 1, ..Default::default() })
        .await
        .unwrap();
    let high2 = queue
        .add("high2", json!({}), JobOptions { priority: 1, ..Default::default() })
        .await
        .unwrap();

    let processor = Arc::new(RecordingProcessor::new());
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    queue.resume().await.unwrap();
    assert!(wait_until(10_000, || async { processor.processed_ids().len() == 3 }).await);
    // strict priority, FIFO within a class
    assert_eq!(processor.processed_ids(), vec![high.id, high2.id, low.id]);

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn failed_jobs_retry_with_exponential_backoff() {
    let queue = test_queue("backoff").await;
    let job = queue
        .add(
            "flaky",
            json!({}),
            JobOptions {
                attempts: 3,
                backoff: Some(BackoffOptions::Strategy(BackoffStrategyOptions {
                    kind: BackoffKind::Exponential,
                    delay: Some(200),
                    options: None,
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // two induced failures, success on the third try
    let processor = Arc::new(RecordingProcessor::failing_first(2));
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            queue.get_state(&job.id).await.unwrap() == JobState::Completed
        })
        .await
    );
    let done = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.attempts_made, 2);
    assert_eq!(done.attempts_started, 3);
    assert_eq!(done.stacktrace.len(), 2);

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn exhausted_attempts_land_in_failed() {
    let queue = test_queue("exhausted").await;
    let job = queue
        .add(
            "doomed",
            json!({}),
            JobOptions {
                attempts: 3,
                backoff: Some(BackoffOptions::Millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let processor = Arc::new(RecordingProcessor::failing_first(u32::MAX));
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            queue.get_state(&job.id).await.unwrap() == JobState::Failed
        })
        .await
    );
    let failed = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.attempts_made, 3);
    assert_eq!(failed.failed_reason.as_deref(), Some("induced failure #3"));
    assert_eq!(failed.stacktrace.len(), 3);

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn stalled_jobs_fail_past_the_recovery_limit() {
    let queue = test_queue("stalled").await;
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            queue
                .add("stuck", json!({"i": i}), JobOptions::default())
                .await
                .unwrap()
                .id,
        );
    }

    // first worker grabs all four and dies without reporting
    let hanging = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::new(HangingProcessor),
        WorkerOptions {
            concurrency: 4,
            lock_duration: 1_000,
            skip_lock_renewal: true,
            skip_stalled_check: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(
        wait_until(5_000, || async {
            queue.get_job_counts().await.unwrap().active == 4
        })
        .await
    );
    hanging.close(true).await;

    // second worker's stalled checker fails them once the locks expire
    let processor = Arc::new(RecordingProcessor::new());
    let checker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions {
            stalled_interval: 100,
            max_stalled_count: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            queue.get_job_counts().await.unwrap().failed == 4
        })
        .await
    );
    for id in &ids {
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(
            job.failed_reason.as_deref(),
            Some("job stalled more than allowable limit")
        );
        assert_eq!(job.attempts_started, 2);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.stalled_counter, 1);
    }

    checker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn rate_limiter_spaces_out_dispatches() {
    let queue = test_queue("limiter").await;
    for i in 0..3 {
        queue.add("limited", json!({"i": i}), JobOptions::default()).await.unwrap();
    }

    let processor = Arc::new(RecordingProcessor::new());
    let started = Instant::now();
    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions {
            limiter: Some(RateLimiterOptions {
                max: 1,
                duration: 400,
                group_limited: false,
            }),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(wait_until(10_000, || async { processor.processed_ids().len() == 3 }).await);
    // three dispatches through a 1-per-400ms window need two full windows
    assert!(started.elapsed().as_millis() >= 800);

    worker.close(false).await;
    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn graceful_close_waits_for_in_flight_jobs() {
    let queue = test_queue("close").await;
    let mut processor = RecordingProcessor::new();
    processor.sleep_ms = 300;
    let processor = Arc::new(processor);

    let worker = Worker::new(
        &redis_url(),
        queue.name(),
        Arc::clone(&processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    let job = queue.add("slow", json!({}), JobOptions::default()).await.unwrap();
    assert!(
        wait_until(5_000, || async {
            queue.get_job_counts().await.unwrap().active == 1
        })
        .await
    );

    worker.close(false).await;
    assert_eq!(queue.get_state(&job.id).await.unwrap(), JobState::Completed);

    destroy(&queue).await;
}
