//! Flow engine behavior against a live store.


use std::sync::Arc;

use serde_json::json;

use conveyor::{
    FlowJob, FlowProducer, FlowProducerOptions, JobOptions, JobState, Worker, WorkerOptions,
};
use test_harness::{destroy, redis_url, test_queue, wait_until, RecordingProcessor};

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn parent_unblocks_when_children_complete() {
    let parent_queue = test_queue("flow-parent").await;
    let child_queue = test_queue("flow-child").await;

    let producer = FlowProducer::new(&redis_url(), FlowProducerOptions::default())
        .await
        .unwrap();
    let tree = producer
        .add(
            FlowJob::new(parent_queue.name(), "assemble", json!({}))
                .with_child(FlowJob::new(child_queue.name(), "part", json!({"n": 1})))
                .with_child(FlowJob::new(child_queue.name(), "part", json!({"n": 2}))),
        )
        .await
        .unwrap();

    assert_eq!(
        parent_queue.get_state(&tree.job_id).await.unwrap(),
        JobState::WaitingChildren
    );

    let child_processor = Arc::new(RecordingProcessor::new());
    let child_worker = Worker::new(
        &redis_url(),
        child_queue.name(),
        Arc::clone(&child_processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions {
            concurrency: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            parent_queue.get_state(&tree.job_id).await.unwrap() == JobState::Waiting
        })
        .await
    );

    let parent_processor = Arc::new(RecordingProcessor::new());
    let parent_worker = Worker::new(
        &redis_url(),
        parent_queue.name(),
        Arc::clone(&parent_processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            parent_queue.get_state(&tree.job_id).await.unwrap() == JobState::Completed
        })
        .await
    );

    child_worker.close(false).await;
    parent_worker.close(false).await;
    destroy(&parent_queue).await;
    destroy(&child_queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn fail_parent_on_failure_propagates() {
    let parent_queue = test_queue("flow-fpof").await;
    let child_queue = test_queue("flow-fpof-child").await;

    let producer = FlowProducer::new(&redis_url(), FlowProducerOptions::default())
        .await
        .unwrap();
    let child = FlowJob::new(child_queue.name(), "doomed", json!({})).with_opts(JobOptions {
        attempts: 1,
        fail_parent_on_failure: true,
        ..Default::default()
    });
    let tree = producer
        .add(FlowJob::new(parent_queue.name(), "assemble", json!({})).with_child(child))
        .await
        .unwrap();
    let child_id = tree.children[0].job_id.clone();

    let child_processor = Arc::new(RecordingProcessor::failing_first(u32::MAX));
    let child_worker = Worker::new(
        &redis_url(),
        child_queue.name(),
        Arc::clone(&child_processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(10_000, || async {
            parent_queue.get_state(&tree.job_id).await.unwrap() == JobState::Failed
        })
        .await
    );

    let parent = parent_queue.get_job(&tree.job_id).await.unwrap().unwrap();
    let expected = format!("child bull:{}:{} failed", child_queue.name(), child_id);
    assert_eq!(parent.failed_reason.as_deref(), Some(expected.as_str()));

    child_worker.close(false).await;
    destroy(&parent_queue).await;
    destroy(&child_queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn adding_under_a_missing_parent_is_rejected() {
    let queue = test_queue("flow-no-parent").await;
    let producer = FlowProducer::new(&redis_url(), FlowProducerOptions::default())
        .await
        .unwrap();

    let ghost = conveyor::ParentRef {
        id: "404".to_string(),
        queue_key: format!("bull:{}", queue.name()),
    };
    let err = producer
        .add_under(&ghost, FlowJob::new(queue.name(), "orphan", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, conveyor::ConveyorError::ParentMissing(_)));

    // nothing was written
    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.waiting + counts.prioritized + counts.delayed, 0);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running redis server (REDIS_URL)"]
async fn ignored_child_failures_are_recorded_and_skipped() {
    let parent_queue = test_queue("flow-idof").await;
    let child_queue = test_queue("flow-idof-child").await;

    let producer = FlowProducer::new(&redis_url(), FlowProducerOptions::default())
        .await
        .unwrap();
    let child = FlowJob::new(child_queue.name(), "optional", json!({})).with_opts(JobOptions {
        attempts: 1,
        ignore_dependency_on_failure: true,
        ..Default::default()
    });
    let tree = producer
        .add(FlowJob::new(parent_queue.name(), "assemble", json!({})).with_child(child))
        .await
        .unwrap();

    let child_processor = Arc::new(RecordingProcessor::failing_first(u32::MAX));
    let child_worker = Worker::new(
        &redis_url(),
        child_queue.name(),
        Arc::clone(&child_processor) as Arc<dyn conveyor::Processor>,
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    // the failed child unblocks the parent anyway
    assert!(
        wait_until(10_000, || async {
            parent_queue.get_state(&tree.job_id).await.unwrap() == JobState::Waiting
        })
        .await
    );

    child_worker.close(false).await;
    destroy(&parent_queue).await;
    destroy(&child_queue).await;
}
