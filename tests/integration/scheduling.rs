//! Scheduling correctness tests.
//!
//! These tests verify queue order, dependency gating, retry handling and
//! failure propagation through the public scheduler API.

use serde_json::json;

use colony::core::{Priority, TaskStatus};
use colony::orchestration::ColonyEvent;
use colony::Error;

use crate::fixtures::{colony_config, implementation, task_id, testing, ColonyHarness};

/// Test: Diamond Dependencies
/// Given a -> {b, c} -> d
/// When tasks complete in order
/// Then d is only queued once both b and c have completed
#[tokio::test]
async fn test_diamond_dependencies_gate_join() {
    let mut config = colony_config();
    config.castes[0].min_count = 2;
    let harness = ColonyHarness::new(config);

    let a = harness.submit(implementation("a")).await;
    let b = harness
        .submit(implementation("b").with_dependencies(&[&a]))
        .await;
    let c = harness
        .submit(implementation("c").with_dependencies(&[&a]))
        .await;
    let d = harness
        .submit(implementation("d").with_dependencies(&[&b, &c]))
        .await;

    let mut scheduler = harness.scheduler.write().await;
    assert_eq!(scheduler.status(&a), Some(&TaskStatus::Executing));
    assert_eq!(scheduler.status(&d), Some(&TaskStatus::Waiting));

    scheduler.complete_task(&a, json!("a done")).unwrap();
    assert_eq!(scheduler.status(&b), Some(&TaskStatus::Executing));
    assert_eq!(scheduler.status(&c), Some(&TaskStatus::Executing));
    assert_eq!(scheduler.status(&d), Some(&TaskStatus::Waiting));

    scheduler.complete_task(&b, json!("b done")).unwrap();
    assert_eq!(scheduler.status(&d), Some(&TaskStatus::Waiting));

    scheduler.complete_task(&c, json!("c done")).unwrap();
    assert_eq!(scheduler.status(&d), Some(&TaskStatus::Executing));

    scheduler.complete_task(&d, json!("d done")).unwrap();
    let analytics = scheduler.distribution_analytics();
    assert_eq!(analytics.completed, 4);
    assert_eq!(analytics.success_rate, 1.0);
}

/// Test: Priority Order
/// Given one builder busy and a backlog of mixed priorities
/// When the builder frees up
/// Then the highest priority task goes next, ties by submission order
#[tokio::test]
async fn test_backlog_drains_by_priority() {
    let harness = ColonyHarness::new(colony_config());

    let first = harness.submit(implementation("first")).await;
    harness
        .submit(implementation("low").with_priority(Priority::Low))
        .await;
    harness
        .submit(implementation("medium").with_priority(Priority::Medium))
        .await;
    harness
        .submit(implementation("high-1").with_priority(Priority::High))
        .await;
    harness
        .submit(implementation("high-2").with_priority(Priority::High))
        .await;

    let mut scheduler = harness.scheduler.write().await;
    assert_eq!(
        scheduler.queued_ids(),
        vec![
            task_id("high-1"),
            task_id("high-2"),
            task_id("medium"),
            task_id("low")
        ]
    );

    let mut order = Vec::new();
    let mut current = first;
    for _ in 0..4 {
        scheduler.complete_task(&current, json!(null)).unwrap();
        current = scheduler
            .graph()
            .nodes()
            .find(|n| n.status == TaskStatus::Executing)
            .map(|n| n.id().clone())
            .expect("next task should be executing");
        order.push(current.clone());
    }
    assert_eq!(
        order,
        vec![
            task_id("high-1"),
            task_id("high-2"),
            task_id("medium"),
            task_id("low")
        ]
    );
}

/// Test: Castes Drain Independently
/// Given the only builder is busy
/// When a testing task is submitted behind queued implementation work
/// Then the guardian picks it up anyway
#[tokio::test]
async fn test_saturated_caste_does_not_block_others() {
    let harness = ColonyHarness::new(colony_config());

    harness.submit(implementation("impl-1")).await;
    harness
        .submit(implementation("impl-2").with_priority(Priority::High))
        .await;
    let check = harness.submit(testing("check")).await;

    let scheduler = harness.scheduler.read().await;
    assert_eq!(scheduler.status(&check), Some(&TaskStatus::Executing));
    assert_eq!(scheduler.queued_ids(), vec![task_id("impl-2")]);
    assert_eq!(scheduler.queue_depth_by_caste().get("builders"), Some(&1));
}

/// Test: Explicit Routes
/// Given a route table entry for a task type
/// When that type is submitted
/// Then the table wins over keyword matching
#[tokio::test]
async fn test_route_table_overrides_keywords() {
    let mut config = colony_config();
    config
        .routes
        .insert("code-review".to_string(), "guardians".to_string());
    let mut harness = ColonyHarness::new(config);
    harness.drain();

    harness
        .submit(colony::core::TaskSubmission::new("code-review").with_id("cr"))
        .await;

    let assigned = harness
        .drain()
        .into_iter()
        .find_map(|e| match e {
            ColonyEvent::TaskAssigned { caste, .. } => Some(caste),
            _ => None,
        })
        .expect("task should be assigned");
    assert_eq!(assigned, "guardians");
}

/// Test: Failure Propagation
/// Given a chain a -> b -> c and a side task
/// When a fails with no retries left
/// Then b and c fail as blocked and the side task is untouched
#[tokio::test]
async fn test_permanent_failure_blocks_transitive_dependents() {
    let mut harness = ColonyHarness::new(colony_config());

    let a = harness.submit(implementation("a").with_max_retries(1)).await;
    let b = harness
        .submit(implementation("b").with_dependencies(&[&a]))
        .await;
    let c = harness.submit(testing("c").with_dependencies(&[&b])).await;
    let side = harness.submit(testing("side")).await;
    harness.drain();

    let mut scheduler = harness.scheduler.write().await;
    scheduler.fail_task(&a, "compile error").unwrap();

    for id in [&a, &b, &c] {
        assert!(
            matches!(scheduler.status(id), Some(TaskStatus::Failed { .. })),
            "{} should have failed",
            id
        );
    }
    assert_eq!(
        scheduler.status(&b),
        Some(&TaskStatus::Failed {
            reason: "upstream failure".to_string()
        })
    );
    assert_eq!(scheduler.status(&side), Some(&TaskStatus::Executing));

    // A late submission that depends on the failed task is blocked at once.
    let late = scheduler
        .submit(testing("late").with_dependencies(&[&a]))
        .unwrap();
    assert!(matches!(
        scheduler.status(&late),
        Some(TaskStatus::Failed { .. })
    ));
    drop(scheduler);

    let blocked: Vec<_> = harness
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ColonyEvent::TaskBlocked { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(blocked.len(), 3);
    assert!(blocked.contains(&b));
    assert!(blocked.contains(&c));
}

/// Test: Retry With Fencing
/// Given a task with retries left
/// When its first attempt fails and a late report arrives from that attempt
/// Then the task is re-assigned under a new epoch and the late report is rejected
#[tokio::test]
async fn test_retry_reassigns_and_fences_old_attempt() {
    let mut harness = ColonyHarness::new(colony_config());
    let id = harness
        .submit(implementation("flaky").with_max_retries(3))
        .await;

    let mut scheduler = harness.scheduler.write().await;
    let first_epoch = scheduler.node(&id).unwrap().epoch;
    scheduler
        .fail_with_epoch(&id, first_epoch, "network blip")
        .unwrap();

    let node = scheduler.node(&id).unwrap();
    assert_eq!(node.status, TaskStatus::Executing);
    assert_eq!(node.retries, 1);
    assert_eq!(node.epoch, first_epoch + 1);

    let stale = scheduler.complete_with_epoch(&id, first_epoch, json!("late"));
    assert!(matches!(stale, Err(Error::StaleAssignment { .. })));
    assert_eq!(scheduler.status(&id), Some(&TaskStatus::Executing));

    scheduler
        .complete_with_epoch(&id, first_epoch + 1, json!("ok"))
        .unwrap();
    assert_eq!(scheduler.status(&id), Some(&TaskStatus::Completed));
    drop(scheduler);

    let events = harness.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, ColonyEvent::TaskRetrying { attempt: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ColonyEvent::StaleReportDiscarded { .. })));
}

/// Test: Submission Validation
/// Given an existing task graph
/// When invalid submissions arrive
/// Then each is rejected and the graph is unchanged
#[tokio::test]
async fn test_invalid_submissions_leave_graph_unchanged() {
    let harness = ColonyHarness::new(colony_config());
    let a = harness.submit(implementation("a")).await;

    let mut scheduler = harness.scheduler.write().await;
    let before = scheduler.graph().len();

    assert!(scheduler.submit(implementation("a")).is_err());
    assert!(scheduler
        .submit(implementation("orphan").with_dependencies(&[&task_id("missing")]))
        .is_err());
    assert!(scheduler
        .submit(colony::core::TaskSubmission::new("  "))
        .is_err());
    assert_eq!(scheduler.graph().len(), before);
    assert_eq!(scheduler.status(&a), Some(&TaskStatus::Executing));
}

/// Test: Cancellation
/// Given a waiting task and an executing task
/// When both are cancelled
/// Then the waiting one is removed and the executing one waits for acknowledgement
#[tokio::test]
async fn test_cancel_waiting_and_executing() {
    let mut harness = ColonyHarness::new(colony_config());
    let running = harness.submit(implementation("running")).await;
    let waiting = harness.submit(implementation("waiting")).await;
    harness.drain();

    let mut scheduler = harness.scheduler.write().await;
    assert_eq!(
        scheduler.cancel_task(&waiting).unwrap(),
        colony::orchestration::Cancellation::Removed
    );
    assert!(scheduler.node(&waiting).is_none());
    // Cancelled ids are never reused.
    assert!(scheduler.submit(implementation("waiting")).is_err());

    let requested = scheduler.cancel_task(&running).unwrap();
    assert!(matches!(
        requested,
        colony::orchestration::Cancellation::Requested { .. }
    ));
    assert_eq!(scheduler.status(&running), Some(&TaskStatus::Executing));

    scheduler.acknowledge_cancel(&running).unwrap();
    assert_eq!(scheduler.status(&running), Some(&TaskStatus::Cancelled));
    assert_eq!(scheduler.registry().working_count("builders"), 0);
    drop(scheduler);

    let events = harness.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, ColonyEvent::CancelRequested { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ColonyEvent::TaskCancelled { .. })));
}
