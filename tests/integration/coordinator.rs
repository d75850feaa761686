//! Coordinator event loop tests.
//!
//! These tests talk to a running colony only through its `ColonyHandle`
//! and event stream, acting as the worker runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use colony::core::{Priority, TaskStatus, TaskSubmission, Worker, WorkerId};
use colony::orchestration::{
    Cancellation, ColonyEvent, Coordinator, EventReceiver, LoopbackProbe, ScalingAction,
    SchedulerMetrics, WorkerProbe,
};
use colony::{Error, Result};

use crate::fixtures::{colony_config, implementation, task_id, testing};

const WAIT: Duration = Duration::from_secs(5);

/// Fails every ping to workers of one caste.
struct CasteDownProbe(&'static str);

#[async_trait]
impl WorkerProbe for CasteDownProbe {
    async fn ping(&self, worker: &Worker) -> Result<Duration> {
        if worker.caste == self.0 {
            Err(Error::Validation("no route to host".to_string()))
        } else {
            Ok(Duration::from_millis(1))
        }
    }
}

/// Next event matching `pick`, skipping the rest.
async fn next_matching<T>(
    events: &mut EventReceiver,
    mut pick: impl FnMut(ColonyEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Test: Batch Runs To Completion
/// Given a dependency chain across two castes plus an independent task
/// When the runtime completes every assignment it is handed
/// Then every task completes and analytics account for each worker
#[tokio::test]
async fn test_batch_runs_to_completion() {
    let (handle, mut events) = Coordinator::start(
        colony_config(),
        Arc::new(LoopbackProbe),
        Arc::new(SchedulerMetrics),
    )
    .unwrap();

    let build = handle.submit(implementation("build")).await.unwrap();
    handle
        .submit(testing("verify").with_dependencies(&[&build]))
        .await
        .unwrap();
    handle
        .submit(
            TaskSubmission::new("package release")
                .with_id("ship")
                .with_dependencies(&[&task_id("verify")]),
        )
        .await
        .unwrap();
    handle
        .submit(testing("lint").with_priority(Priority::Low))
        .await
        .unwrap();

    let mut completed = 0;
    while completed < 4 {
        let (task, epoch) = next_matching(&mut events, |e| match e {
            ColonyEvent::TaskAssigned { task_id, epoch, .. } => Some((task_id, epoch)),
            _ => None,
        })
        .await;
        handle
            .complete_with_epoch(&task, epoch, json!({ "task": task.as_str() }))
            .await
            .unwrap();
        completed += 1;
    }

    let analytics = handle.analytics().await.unwrap();
    assert_eq!(analytics.total, 4);
    assert_eq!(analytics.completed, 4);
    assert_eq!(analytics.success_rate, 1.0);
    assert_eq!(analytics.by_worker.values().sum::<u64>(), 4);

    // "package release" matches no keyword, so it goes to the default caste.
    let ship = handle.task(&task_id("ship")).await.unwrap().unwrap();
    assert_eq!(ship.status, TaskStatus::Completed);
    assert!(ship
        .assigned_worker
        .as_ref()
        .is_some_and(|w| w.as_str().starts_with("builders")));

    handle.shutdown().await.unwrap();
}

/// Test: Cancel Through The Handle
/// Given a task executing on a worker
/// When it is cancelled and the runtime acknowledges
/// Then the task ends cancelled and the worker takes the next task
#[tokio::test]
async fn test_cancel_executing_task() {
    let (handle, mut events) = Coordinator::start(
        colony_config(),
        Arc::new(LoopbackProbe),
        Arc::new(SchedulerMetrics),
    )
    .unwrap();

    let doomed = handle.submit(implementation("doomed")).await.unwrap();
    let next = handle.submit(implementation("next")).await.unwrap();

    let cancellation = handle.cancel(&doomed).await.unwrap();
    assert!(matches!(cancellation, Cancellation::Requested { .. }));

    let requested = next_matching(&mut events, |e| match e {
        ColonyEvent::CancelRequested { task_id, .. } => Some(task_id),
        _ => None,
    })
    .await;
    assert_eq!(requested, doomed);
    handle.acknowledge_cancel(&doomed).await.unwrap();

    let doomed_node = handle.task(&doomed).await.unwrap().unwrap();
    assert_eq!(doomed_node.status, TaskStatus::Cancelled);
    let next_node = handle.task(&next).await.unwrap().unwrap();
    assert_eq!(next_node.status, TaskStatus::Executing);

    // A finished task cannot be cancelled again.
    assert!(matches!(
        handle.cancel(&doomed).await,
        Err(Error::InvalidTransition { .. })
    ));

    handle.shutdown().await.unwrap();
}

/// Test: Unknown Workers
/// Given a running colony
/// When a heartbeat names a worker that does not exist
/// Then the request fails without disturbing the loop
#[tokio::test]
async fn test_heartbeat_for_unknown_worker() {
    let (handle, _events) = Coordinator::start(
        colony_config(),
        Arc::new(LoopbackProbe),
        Arc::new(SchedulerMetrics),
    )
    .unwrap();

    let result = handle.heartbeat(&WorkerId::from("ghost-99")).await;
    assert!(matches!(result, Err(Error::WorkerNotFound(_))));
    assert!(handle.is_running());

    let report = handle.run_health_check().await.unwrap();
    assert!(report.records.iter().all(|r| r.healthy));

    handle.shutdown().await.unwrap();
}

/// Test: Escalation Triggers Emergency Scaling
/// Given a critical caste with no standby supply
/// When its only worker fails health checks
/// Then the coordinator scales the caste up without waiting for a scaling tick
#[tokio::test]
async fn test_escalation_triggers_emergency_scale_up() {
    let mut config = colony_config();
    config.recovery.backup_count = 0;
    config.recovery.allow_lazy_backup = false;
    let (handle, mut events) = Coordinator::start(
        config,
        Arc::new(CasteDownProbe("builders")),
        Arc::new(SchedulerMetrics),
    )
    .unwrap();

    let report = handle.run_health_check().await.unwrap();
    assert_eq!(report.recoveries.len(), 1);

    let failures = next_matching(&mut events, |e| match e {
        ColonyEvent::CasteEscalated { caste, failures } if caste == "builders" => Some(failures),
        _ => None,
    })
    .await;
    assert_eq!(failures, 1);

    let decision = next_matching(&mut events, |e| match e {
        ColonyEvent::ScalingRecommended { decision } => Some(decision),
        _ => None,
    })
    .await;
    assert_eq!(decision.caste, "builders");
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.target_count, 2);

    let summary = tokio::time::timeout(WAIT, async {
        loop {
            let summary = handle.summary().await.unwrap();
            if summary.by_caste["builders"].active == 2 {
                return summary;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("emergency scale-up never applied");
    assert_eq!(summary.by_caste["builders"].error, 1);
    assert_eq!(summary.by_caste["builders"].idle, 1);

    handle.shutdown().await.unwrap();
}

/// Test: Health Checks Run Off The Loop
/// Given a recovery that sits in a long failover delay
/// When other requests arrive during the check
/// Then they are answered before the check finishes
#[tokio::test]
async fn test_commands_answered_during_slow_recovery() {
    let mut config = colony_config();
    config.recovery.failover_delay_ms = 2_000;
    let (handle, _events) = Coordinator::start(
        config,
        Arc::new(CasteDownProbe("guardians")),
        Arc::new(SchedulerMetrics),
    )
    .unwrap();

    let check = handle.run_health_check();
    let meanwhile = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_millis(500), handle.summary()).await
    };
    let (report, summary) = tokio::join!(check, meanwhile);

    let summary = summary.expect("summary waited on the health check").unwrap();
    assert_eq!(summary.by_caste["guardians"].active, 1);
    assert_eq!(report.unwrap().recoveries.len(), 1);

    handle.shutdown().await.unwrap();
}
