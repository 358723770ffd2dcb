//! Dataset version registry: retry をまたいだ identity、不一致、最新の参照

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Harness, RAW_DATASET, raw_output};
use conduit_core::domain::{
    CompleteOutcome, CompletionRequest, DatasetName, OutputRecord, PublishOutcome, Rejection, Span,
    TaskId, TaskStatus, VersionId,
};

/// Fail attempt 1 through the reaper and hand back attempt 2's grant.
async fn reap_and_reclaim(h: &Harness, task_id: TaskId) -> conduit_core::domain::ClaimGrant {
    h.advance_secs(31);
    assert_eq!(h.dispatcher.reaper.tick().await.unwrap().reaped, 1);
    h.advance_secs(1);
    assert_eq!(h.dispatcher.retries.tick().await.unwrap().requeued, 1);
    let grant = h.claim(task_id, "w2").await;
    assert_eq!(grant.attempt, 2);
    grant
}

#[tokio::test]
async fn retry_that_republishes_the_same_output_keeps_one_version() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    let task_id = h.trigger(&job).await;
    let first = h.claim(task_id, "w1").await;

    // Attempt 1 publishes, then dies before completing.
    let published = h
        .dispatcher
        .datasets
        .publish(&first.fence(), raw_output("mem://a", Span::cursor(0)))
        .await
        .unwrap();
    let PublishOutcome::Inserted { version } = published else {
        panic!("expected an insert, got {published:?}");
    };
    assert_eq!(version.attempt, 1);
    assert!(version.version_id.as_str().starts_with("dsv-"));

    let second = reap_and_reclaim(&h, task_id).await;
    let request =
        CompletionRequest::succeeded(&second.fence()).output(raw_output("mem://a", Span::cursor(0)));
    let CompleteOutcome::Accepted(receipt) = h.dispatcher.leases.complete(request).await.unwrap() else {
        panic!("identical republish should be accepted");
    };
    assert_eq!(receipt.published, vec![version.version_id.clone()]);

    let versions = h.store.versions_of(&RAW_DATASET.into()).await;
    assert_eq!(versions.len(), 1);
    let stored = h.dispatcher.datasets.get(&version.version_id).await.unwrap().unwrap();
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.content_hash, version.content_hash);
}

#[tokio::test]
async fn divergent_republish_is_rejected_and_the_task_keeps_running() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    let task_id = h.trigger(&job).await;
    let first = h.claim(task_id, "w1").await;
    h.dispatcher
        .datasets
        .publish(&first.fence(), raw_output("mem://a", Span::cursor(0)))
        .await
        .unwrap();

    let second = reap_and_reclaim(&h, task_id).await;
    let request =
        CompletionRequest::succeeded(&second.fence()).output(raw_output("mem://b", Span::cursor(0)));
    let outcome = h.dispatcher.leases.complete(request).await.unwrap();
    let CompleteOutcome::Rejected(Rejection::Divergent {
        existing_hash,
        offered_hash,
        ..
    }) = outcome
    else {
        panic!("expected divergence, got {outcome:?}");
    };
    assert_ne!(existing_hash, offered_hash);

    let task = h.dispatcher.leases.fetch(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.attempt, 2);

    let versions = h.store.versions_of(&RAW_DATASET.into()).await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].descriptor.storage_ref, "mem://a");
}

#[tokio::test]
async fn publish_requires_the_current_attempt_and_the_bound_dataset() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    let task_id = h.trigger(&job).await;
    let first = h.claim(task_id, "w1").await;

    let foreign = OutputRecord {
        dataset: DatasetName::new("someone_elses"),
        ..raw_output("mem://a", Span::cursor(0))
    };
    let outcome = h.dispatcher.datasets.publish(&first.fence(), foreign).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Rejected { .. }));

    let second = reap_and_reclaim(&h, task_id).await;
    let late = h
        .dispatcher
        .datasets
        .publish(&first.fence(), raw_output("mem://a", Span::cursor(0)))
        .await
        .unwrap();
    assert!(matches!(late, PublishOutcome::Rejected { .. }));
    assert!(h.store.versions_of(&RAW_DATASET.into()).await.is_empty());

    let current = h
        .dispatcher
        .datasets
        .publish(&second.fence(), raw_output("mem://a", Span::cursor(0)))
        .await
        .unwrap();
    let PublishOutcome::Inserted { version } = current else {
        panic!("expected an insert, got {current:?}");
    };
    assert_eq!(version.attempt, 2);
}

#[tokio::test]
async fn latest_is_the_most_recent_publication() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    let dataset = DatasetName::new(RAW_DATASET);
    assert!(h.dispatcher.datasets.latest(&dataset).await.unwrap().is_none());

    let mut published = Vec::new();
    for (storage_ref, position) in [("mem://one", 0), ("mem://two", 10)] {
        let task_id = h.trigger(&job).await;
        let grant = h.claim(task_id, "w1").await;
        let request = CompletionRequest::succeeded(&grant.fence())
            .output(raw_output(storage_ref, Span::cursor(position)));
        let CompleteOutcome::Accepted(receipt) = h.dispatcher.leases.complete(request).await.unwrap() else {
            panic!("completion should be accepted");
        };
        published.extend(receipt.published);
        h.advance_secs(1);
    }

    let latest = h.dispatcher.datasets.latest(&dataset).await.unwrap().unwrap();
    assert_eq!(latest.version_id, published[1]);
    assert_eq!(latest.descriptor.storage_ref, "mem://two");
    assert!(
        h.dispatcher
            .datasets
            .get(&VersionId::new("dsv-missing"))
            .await
            .unwrap()
            .is_none()
    );
}
