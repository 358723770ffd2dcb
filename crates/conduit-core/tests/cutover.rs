//! Pointer cutover: 正確な rollback、二段階 staging、withheld な task

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use proptest::prelude::*;

use common::{Harness, RAW, RAW_DATASET, compact_job, ingest_job, raw_output};
use conduit_core::app::RoutePlan;
use conduit_core::domain::{
    ClaimOutcome, CompleteOutcome, CompletionRequest, ConfigVersion, CutoverOutcome,
    CutoverRejection, CutoverRequest, DatasetName, JobName, NewTask, NotClaimedReason,
    OutboxEffect, OutputEvent, PendingCutover, PointerName, PointerSet, PointerSnapshot, Span,
    TaskRecord, TaskStatus, TaskTrigger, VersionId, WorkerId,
};
use conduit_core::ports::{Clock, StateStore};

/// Run one manual ingest task and return the version it published.
async fn publish(h: &Harness, job: &JobName, position: i64) -> VersionId {
    let task_id = h.trigger(job).await;
    let grant = h.claim(task_id, "w1").await;
    let request = CompletionRequest::succeeded(&grant.fence())
        .output(raw_output(&format!("mem://{position}"), Span::cursor(position)));
    let CompleteOutcome::Accepted(receipt) = h.dispatcher.leases.complete(request).await.unwrap() else {
        panic!("publish should be accepted");
    };
    receipt.published[0].clone()
}

fn committed(outcome: CutoverOutcome) -> PointerSnapshot {
    match outcome {
        CutoverOutcome::Committed { snapshot } => snapshot,
        other => panic!("expected a commit, got {other:?}"),
    }
}

fn bytes(set: &PointerSet) -> Vec<u8> {
    serde_json::to_vec(set).unwrap()
}

#[tokio::test]
async fn rollback_restores_the_prior_set_byte_for_byte() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    let a = publish(&h, &job, 0).await;
    let b = publish(&h, &job, 10).await;

    let cutover = &h.dispatcher.cutover;
    committed(cutover.cutover(CutoverRequest::new().pointer("raw", a.clone())).await.unwrap());
    let before = cutover.snapshot().await.unwrap();

    let after = committed(
        cutover
            .cutover(CutoverRequest::new().pointer("raw", b.clone()).pointer("raw_b", b))
            .await
            .unwrap(),
    );
    assert_eq!(after.revision, before.revision + 1);
    assert_ne!(bytes(&after.set), bytes(&before.set));

    let restored = committed(cutover.rollback().await.unwrap());
    assert_eq!(bytes(&restored.set), bytes(&before.set));
    assert_eq!(restored.history_depth, before.history_depth);
    assert_eq!(restored.revision, after.revision + 1);
    assert_eq!(restored.set.get(&PointerName::new("raw")), Some(&a));

    // back through the first pointer move and the initial activation
    committed(cutover.rollback().await.unwrap());
    let empty = committed(cutover.rollback().await.unwrap());
    assert_eq!(bytes(&empty.set), bytes(&PointerSet::default()));
    assert_eq!(
        cutover.rollback().await.unwrap(),
        CutoverOutcome::rejected(CutoverRejection::NothingToRollBack)
    );
}

#[tokio::test]
async fn cutover_to_unknown_targets_is_rejected_and_changes_nothing() {
    let h = Harness::new();
    h.deploy_publisher().await;
    let before = h.dispatcher.cutover.snapshot().await.unwrap();

    let unknown = h
        .dispatcher
        .cutover
        .cutover(CutoverRequest::new().pointer("raw", VersionId::new("dsv-nope")))
        .await
        .unwrap();
    assert!(matches!(
        unknown,
        CutoverOutcome::Rejected {
            rejection: CutoverRejection::UnknownVersion { .. }
        }
    ));

    let undeployed = h
        .dispatcher
        .cutover
        .cutover(CutoverRequest::new().config_version(ConfigVersion(9)))
        .await
        .unwrap();
    assert_eq!(
        undeployed,
        CutoverOutcome::rejected(CutoverRejection::UnknownConfigVersion {
            config_version: ConfigVersion(9)
        })
    );

    let empty = h.dispatcher.cutover.cutover(CutoverRequest::new()).await.unwrap();
    assert_eq!(empty, CutoverOutcome::rejected(CutoverRejection::Empty));

    assert_eq!(h.dispatcher.cutover.snapshot().await.unwrap(), before);
}

#[derive(Debug, Clone)]
enum Op {
    Point { pointer: usize, version: usize },
    Rollback,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..2, 0usize..3).prop_map(|(pointer, version)| Op::Point { pointer, version }),
        2 => Just(Op::Rollback),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any interleaving of cutovers and rollbacks matches a plain stack of sets.
    #[test]
    fn pointer_history_behaves_like_a_stack(ops in prop::collection::vec(arb_op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::new();
            let job = h.deploy_publisher().await;
            let mut versions = Vec::new();
            for position in [0, 10, 20] {
                versions.push(publish(&h, &job, position).await);
            }
            let pointers = ["hot", "cold"];

            let mut current = h.dispatcher.cutover.snapshot().await.unwrap().set;
            let mut history = vec![PointerSet::default()];

            for op in ops {
                let outcome = match op {
                    Op::Point { pointer, version } => {
                        let request = CutoverRequest::new()
                            .pointer(pointers[pointer], versions[version].clone());
                        history.push(current.clone());
                        current = current.apply(&request);
                        h.dispatcher.cutover.cutover(request).await.unwrap()
                    }
                    Op::Rollback => {
                        let outcome = h.dispatcher.cutover.rollback().await.unwrap();
                        match history.pop() {
                            Some(prior) => current = prior,
                            None => prop_assert_eq!(
                                &outcome,
                                &CutoverOutcome::rejected(CutoverRejection::NothingToRollBack)
                            ),
                        }
                        outcome
                    }
                };

                let snapshot = h.dispatcher.cutover.snapshot().await.unwrap();
                prop_assert_eq!(bytes(&snapshot.set), bytes(&current));
                prop_assert_eq!(snapshot.history_depth, history.len());
                if let CutoverOutcome::Committed { snapshot: reported } = outcome {
                    prop_assert_eq!(reported, snapshot);
                }
            }
            Ok(())
        })?;
    }
}

/// v1 live with one consumer, v2 deployed with an extra consumer and staged.
async fn staged_v2(h: &Harness) -> PendingCutover {
    let admin = &h.dispatcher.admin;
    let v1 = admin
        .deploy(ConfigVersion(1), vec![ingest_job(), compact_job("compact_a")])
        .await
        .unwrap();
    assert!(v1.activated);
    let v2 = admin
        .deploy(
            ConfigVersion(2),
            vec![ingest_job(), compact_job("compact_a"), compact_job("compact_v2")],
        )
        .await
        .unwrap();
    assert!(!v2.activated);

    let outcome = h
        .dispatcher
        .cutover
        .begin(CutoverRequest::new().config_version(ConfigVersion(2)))
        .await
        .unwrap();
    let CutoverOutcome::Staged { pending } = outcome else {
        panic!("expected a staged cutover, got {outcome:?}");
    };
    assert_eq!(h.dispatcher.cutover.pending().await.unwrap(), Some(pending.clone()));
    pending
}

/// Run one ingest task under v1 and return its route row, still pending.
async fn ingest_once(h: &Harness) -> (u64, OutputEvent) {
    let task_id = h.trigger(&JobName::new("ingest")).await;
    let outcome = h.dispatcher.worker("w1").execute(task_id).await.unwrap();
    assert!(matches!(outcome, conduit_core::app::WorkOutcome::Completed { .. }));

    h.store
        .outbox_entries()
        .await
        .into_iter()
        .find_map(|row| match row.effect {
            OutboxEffect::RouteEvent { event, .. } => Some((row.id, event)),
            OutboxEffect::WakeUp { .. } => None,
        })
        .expect("completion should enqueue a route row")
}

/// Produce one event under v1 and route it while v2 is staged.
///
/// Returns the live v1 children and the staged v2 children.
async fn route_one_event(h: &Harness) -> (Vec<TaskRecord>, Vec<TaskRecord>) {
    ingest_once(h).await;
    let report = h.dispatcher.drainer.tick().await.unwrap();
    assert_eq!(report.children, 3);

    h.store
        .all_tasks()
        .await
        .into_iter()
        .filter(|t| matches!(t.trigger, TaskTrigger::Event { .. }))
        .partition(|t| t.config_version == ConfigVersion(1))
}

fn names(tasks: &[TaskRecord]) -> Vec<String> {
    let mut names: Vec<_> = tasks.iter().map(|t| t.job_name.as_str().to_string()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn staged_cutover_withholds_new_version_work_until_commit() {
    let h = Harness::new();
    let pending = staged_v2(&h).await;

    let (live, staged) = route_one_event(&h).await;
    assert_eq!(names(&live), vec!["compact_a"]);
    assert_eq!(names(&staged), vec!["compact_a", "compact_v2"]);

    // The live consumer is dispatched; staged wake-ups wait and claims are refused.
    let report = h.dispatcher.drainer.tick().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 2);
    let claim = h
        .dispatcher
        .leases
        .claim(staged[0].task_id, WorkerId::new("w2"))
        .await
        .unwrap();
    assert_eq!(
        claim,
        ClaimOutcome::NotClaimed {
            reason: NotClaimedReason::Withheld
        }
    );

    // No direct moves while staged.
    let rejection = CutoverOutcome::rejected(CutoverRejection::PendingCutoverExists {
        cutover_id: pending.cutover_id,
    });
    let direct = h
        .dispatcher
        .cutover
        .cutover(CutoverRequest::new().config_version(ConfigVersion(1)))
        .await
        .unwrap();
    assert_eq!(direct, rejection);
    assert_eq!(h.dispatcher.cutover.rollback().await.unwrap(), rejection);

    let snapshot = committed(h.dispatcher.cutover.commit(pending.cutover_id).await.unwrap());
    assert_eq!(snapshot.set.config_version, Some(ConfigVersion(2)));
    assert!(h.dispatcher.cutover.pending().await.unwrap().is_none());

    // v2's compact_a replaces the v1 task that never started.
    let superseded = h.dispatcher.leases.fetch(live[0].task_id).await.unwrap().unwrap();
    assert_eq!(superseded.status, TaskStatus::Canceled);

    h.advance_secs(1);
    let report = h.dispatcher.drainer.tick().await.unwrap();
    assert_eq!(report.delivered, 2);
    let grant = h.claim(staged[0].task_id, "w2").await;
    assert_eq!(grant.attempt, 1);
}

#[tokio::test]
async fn abandoned_cutover_cancels_withheld_work_and_keeps_live_work() {
    let h = Harness::new();
    let pending = staged_v2(&h).await;
    let (live, staged) = route_one_event(&h).await;

    let outcome = h.dispatcher.cutover.abandon(pending.cutover_id).await.unwrap();
    let CutoverOutcome::Abandoned { canceled_tasks, .. } = outcome else {
        panic!("expected abandonment, got {outcome:?}");
    };
    let mut expected: Vec<_> = staged.iter().map(|t| t.task_id).collect();
    expected.sort();
    assert_eq!(canceled_tasks, expected);

    for task_id in &expected {
        let task = h.dispatcher.leases.fetch(*task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }
    let snapshot = h.dispatcher.cutover.snapshot().await.unwrap();
    assert_eq!(snapshot.set.config_version, Some(ConfigVersion(1)));
    assert!(h.dispatcher.cutover.pending().await.unwrap().is_none());

    // Canceled wake-ups are dropped; the v1 consumer still runs.
    h.advance_secs(1);
    let report = h.dispatcher.drainer.tick().await.unwrap();
    assert_eq!(report.dropped, 2);
    assert_eq!(report.delivered, 1);
    let outcome = h.dispatcher.worker("w2").execute(live[0].task_id).await.unwrap();
    assert!(matches!(outcome, conduit_core::app::WorkOutcome::Completed { .. }));

    // A second resolve finds nothing staged.
    assert_eq!(
        h.dispatcher.cutover.commit(pending.cutover_id).await.unwrap(),
        CutoverOutcome::rejected(CutoverRejection::NoSuchPendingCutover {
            cutover_id: pending.cutover_id
        })
    );
}

/// Plan a route row while v2 is staged, without applying it.
async fn plan_while_staged(h: &Harness) -> (u64, Vec<NewTask>) {
    let (row_id, event) = ingest_once(h).await;
    let RoutePlan::Tasks {
        config_versions,
        tasks,
    } = h.dispatcher.router.plan(&event).await.unwrap()
    else {
        panic!("event should not be stale");
    };
    assert_eq!(config_versions, vec![ConfigVersion(1), ConfigVersion(2)]);
    assert_eq!(tasks.len(), 3);
    (row_id, tasks)
}

async fn event_task_versions(h: &Harness) -> Vec<(ConfigVersion, TaskStatus)> {
    let mut versions: Vec<_> = h
        .store
        .all_tasks()
        .await
        .into_iter()
        .filter(|t| matches!(t.trigger, TaskTrigger::Event { .. }))
        .map(|t| (t.config_version, t.status))
        .collect();
    versions.sort_by_key(|(version, _)| *version);
    versions
}

#[tokio::test]
async fn abandon_between_plan_and_apply_leaves_no_withheld_tasks() {
    let h = Harness::new();
    let pending = staged_v2(&h).await;
    let (row_id, tasks) = plan_while_staged(&h).await;

    let outcome = h.dispatcher.cutover.abandon(pending.cutover_id).await.unwrap();
    assert!(matches!(outcome, CutoverOutcome::Abandoned { ref canceled_tasks, .. } if canceled_tasks.is_empty()));

    let created = h.store.complete_outbox(row_id, tasks, h.clock.now()).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(
        event_task_versions(&h).await,
        vec![(ConfigVersion(1), TaskStatus::Queued)]
    );

    // Nothing is left for the drainer to defer.
    h.advance_secs(1);
    let report = h.dispatcher.drainer.tick().await.unwrap();
    assert_eq!(report.deferred, 0);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn commit_between_plan_and_apply_routes_only_the_new_version() {
    let h = Harness::new();
    let pending = staged_v2(&h).await;
    let (row_id, tasks) = plan_while_staged(&h).await;

    committed(h.dispatcher.cutover.commit(pending.cutover_id).await.unwrap());

    let created = h.store.complete_outbox(row_id, tasks, h.clock.now()).await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(
        event_task_versions(&h).await,
        vec![
            (ConfigVersion(2), TaskStatus::Queued),
            (ConfigVersion(2), TaskStatus::Queued)
        ]
    );
}

#[tokio::test]
async fn promote_latest_moves_pointers_that_have_a_version() {
    let h = Harness::new();
    let job = h.deploy_publisher().await;
    publish(&h, &job, 0).await;
    let newest = publish(&h, &job, 10).await;

    let bindings = [
        (PointerName::new(RAW), DatasetName::new(RAW_DATASET)),
        (PointerName::new("missing"), DatasetName::new("never_published")),
    ];
    let snapshot = committed(h.dispatcher.cutover.promote_latest(&bindings).await.unwrap());
    assert_eq!(snapshot.set.get(&PointerName::new(RAW)), Some(&newest));
    assert!(snapshot.set.get(&PointerName::new("missing")).is_none());
    assert_eq!(snapshot.set.config_version, Some(ConfigVersion(1)));

    let nothing = h
        .dispatcher
        .cutover
        .promote_latest(&bindings[1..])
        .await
        .unwrap();
    assert_eq!(nothing, CutoverOutcome::rejected(CutoverRejection::Empty));
}
