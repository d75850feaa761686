//! Health monitor and recovery tests.
//!
//! These tests verify that failed workers are restored, replaced by
//! standbys, or escalated, and that held tasks survive each path.

use serde_json::json;

use colony::core::{TaskStatus, WorkerStatus};
use colony::orchestration::{ColonyEvent, HealthIssue, RecoveryOutcome};
use colony::Error;

use crate::fixtures::{colony_config, implementation, testing, ColonyHarness};

/// Test: Backup Takeover
/// Given a builder executing a task and one standby in reserve
/// When the builder stops answering
/// Then the standby takes over the task under a new epoch and the pool is refilled
#[tokio::test]
async fn test_standby_takes_over_held_task() {
    let mut harness = ColonyHarness::new(colony_config());
    let failed = harness.active_worker("builders").await;
    let standby = harness.standbys("builders").await[0].clone();
    let task = harness.submit(implementation("held")).await;
    let old_epoch = harness.scheduler.read().await.node(&task).unwrap().epoch;
    harness.drain();

    harness.probe.take_down(&failed);
    let report = harness.monitor.run_tick().await;

    assert_eq!(
        report.recoveries,
        vec![(
            failed.clone(),
            RecoveryOutcome::Replaced {
                backup: standby.clone(),
                transferred: Some(task.clone()),
            }
        )]
    );

    let mut scheduler = harness.scheduler.write().await;
    assert!(scheduler.registry().get(&failed).is_none());
    assert_eq!(scheduler.registry().active_count("builders"), 1);
    assert_eq!(scheduler.registry().standby_count("builders"), 1);

    let node = scheduler.node(&task).unwrap();
    assert_eq!(node.status, TaskStatus::Executing);
    assert_eq!(node.assigned_worker.as_ref(), Some(&standby));
    assert_eq!(node.retries, 0);
    let new_epoch = node.epoch;
    assert!(new_epoch > old_epoch);

    // The dead worker's late report must not land.
    assert!(matches!(
        scheduler.complete_with_epoch(&task, old_epoch, json!("late")),
        Err(Error::StaleAssignment { .. })
    ));
    scheduler
        .complete_with_epoch(&task, new_epoch, json!("done"))
        .unwrap();
    assert_eq!(
        scheduler.registry().get(&standby).unwrap().status,
        WorkerStatus::Idle
    );
    drop(scheduler);

    let events = harness.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ColonyEvent::HealthAlert { issues, .. } if issues.contains(&HealthIssue::Unresponsive)
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ColonyEvent::TaskAssigned { worker_id, .. } if *worker_id == standby
    )));
}

/// Test: Restart Restores
/// Given a builder executing a task
/// When one ping fails but the worker answers after restart
/// Then the worker is kept and the task is re-queued without using a retry
#[tokio::test]
async fn test_restart_restores_worker_and_requeues() {
    let harness = ColonyHarness::new(colony_config());
    let worker = harness.active_worker("builders").await;
    let standby = harness.standbys("builders").await[0].clone();
    let task = harness.submit(implementation("held")).await;

    harness.probe.fail_times(&worker, 1);
    let report = harness.monitor.run_tick().await;

    assert_eq!(
        report.recoveries,
        vec![(
            worker.clone(),
            RecoveryOutcome::Restored {
                requeued: Some(task.clone())
            }
        )]
    );

    let scheduler = harness.scheduler.read().await;
    let node = scheduler.node(&task).unwrap();
    assert_eq!(node.status, TaskStatus::Executing);
    assert_eq!(node.assigned_worker.as_ref(), Some(&worker));
    assert_eq!(node.retries, 0);
    assert_eq!(node.epoch, 2);
    // The standby was not needed.
    assert_eq!(
        scheduler.registry().get(&standby).unwrap().status,
        WorkerStatus::Standby
    );
    assert_eq!(harness.monitor.history(&worker).await.len(), 2);
}

/// Test: Escalation Threshold
/// Given three guardians and no standby supply
/// When all three die at once
/// Then each escalates and the caste is signalled once the window count passes the threshold
#[tokio::test]
async fn test_repeated_escalations_signal_caste() {
    let mut config = colony_config();
    config.castes[1].min_count = 3;
    config.recovery.allow_lazy_backup = false;
    let (mut harness, mut emergencies) = ColonyHarness::with_emergencies(config);

    let guardians: Vec<_> = {
        let scheduler = harness.scheduler.read().await;
        scheduler
            .registry()
            .workers()
            .into_iter()
            .filter(|w| w.caste == "guardians")
            .map(|w| w.id.clone())
            .collect()
    };
    assert_eq!(guardians.len(), 3);
    let task = harness.submit(testing("check")).await;
    for id in &guardians {
        harness.probe.take_down(id);
    }
    harness.drain();

    let report = harness.monitor.run_tick().await;
    assert_eq!(report.recoveries.len(), 3);
    assert!(report
        .recoveries
        .iter()
        .all(|(_, outcome)| matches!(outcome, RecoveryOutcome::Escalated { .. })));

    {
        let scheduler = harness.scheduler.read().await;
        for id in &guardians {
            assert_eq!(
                scheduler.registry().get(id).unwrap().status,
                WorkerStatus::Error
            );
        }
        // Nobody left to run it, so it waits in the queue.
        assert_eq!(scheduler.status(&task), Some(&TaskStatus::Queued));
    }

    assert_eq!(emergencies.try_recv().ok().as_deref(), Some("guardians"));
    assert!(emergencies.try_recv().is_err());
    assert!(harness
        .drain()
        .iter()
        .any(|e| matches!(e, ColonyEvent::CasteEscalated { failures: 3, .. })));

    // Still down on the next tick: each is swapped for a fresh guardian,
    // and the waiting task finally runs.
    let report = harness.monitor.run_tick().await;
    assert!(report.recoveries.is_empty());
    assert_eq!(report.replaced.len(), 3);
    let scheduler = harness.scheduler.read().await;
    assert_eq!(scheduler.registry().active_count("guardians"), 3);
    assert_eq!(scheduler.status(&task), Some(&TaskStatus::Executing));
}

/// Test: Errored Worker At Max Capacity
/// Given a caste bounded to a single worker with no standby supply
/// When that worker escalates and stays down
/// Then a later tick replaces it within bounds and queued work runs
#[tokio::test]
async fn test_errored_worker_at_max_is_replaced() {
    let mut config = colony_config();
    config.castes[0].max_count = 1;
    config.recovery.critical_castes.clear();
    config.recovery.backup_count = 0;
    config.recovery.allow_lazy_backup = false;
    let mut harness = ColonyHarness::new(config);
    let builder = harness.active_worker("builders").await;

    harness.probe.take_down(&builder);
    let report = harness.monitor.run_tick().await;
    assert!(matches!(
        report.recoveries.as_slice(),
        [(_, RecoveryOutcome::Escalated { .. })]
    ));
    for _ in 0..3 {
        harness.monitor.run_tick().await;
    }
    harness.drain();

    let task = harness.submit(implementation("after")).await;
    let scheduler = harness.scheduler.read().await;
    assert!(scheduler.registry().get(&builder).is_none());
    assert_eq!(scheduler.registry().active_count("builders"), 1);
    assert_eq!(scheduler.status(&task), Some(&TaskStatus::Executing));
    assert_ne!(
        scheduler.node(&task).unwrap().assigned_worker.as_ref(),
        Some(&builder)
    );
}

/// Test: Critical Caste Escalation
/// Given a critical caste with no standby and lazy spawning off
/// When its only worker dies
/// Then the first escalation already signals the caste
#[tokio::test]
async fn test_critical_caste_escalates_immediately() {
    let mut config = colony_config();
    config.recovery.backup_count = 0;
    config.recovery.allow_lazy_backup = false;
    let (harness, mut emergencies) = ColonyHarness::with_emergencies(config);
    let builder = harness.active_worker("builders").await;

    harness.probe.take_down(&builder);
    let outcome = harness.monitor.initiate_recovery(&builder).await.unwrap();

    assert!(matches!(outcome, RecoveryOutcome::Escalated { .. }));
    assert_eq!(emergencies.try_recv().ok().as_deref(), Some("builders"));
}

/// Test: Standby Hygiene
/// Given a critical caste with one standby
/// When the standby stops answering
/// Then it is discarded and a fresh standby replaces it
#[tokio::test]
async fn test_unresponsive_standby_is_replaced() {
    let harness = ColonyHarness::new(colony_config());
    let standby = harness.standbys("builders").await[0].clone();

    harness.probe.take_down(&standby);
    let report = harness.monitor.run_tick().await;

    assert_eq!(report.discarded, vec![standby.clone()]);
    assert!(report.recoveries.is_empty());
    let standbys = harness.standbys("builders").await;
    assert_eq!(standbys.len(), 1);
    assert_ne!(standbys[0], standby);
}

/// Test: Healthy Colony
/// Given every worker answering
/// When a tick runs
/// Then every worker gets a healthy record and nothing is recovered
#[tokio::test]
async fn test_healthy_tick_is_quiet() {
    let mut harness = ColonyHarness::new(colony_config());
    harness.drain();

    let report = harness.monitor.run_tick().await;

    // builders, guardians, and the builder standby.
    assert_eq!(report.records.len(), 3);
    assert!(report.records.iter().all(|r| r.healthy));
    assert!(report.recoveries.is_empty());
    assert!(report.expired.is_empty());
    assert!(harness.drain().is_empty());
}
