//! The colony event loop.
//!
//! `Coordinator::start` spawns one tokio task that serializes every input
//! stream against the scheduler:
//! - commands from a [`ColonyHandle`] (submit, complete, fail, cancel, queries)
//! - health ticks, which run on their own task so a slow probe never stalls
//!   the loop
//! - scaling ticks
//! - emergency signals from the health monitor
//!
//! Shutdown goes through a `CancellationToken`, as with the other actors.

use crate::config::Config;
use crate::core::task::{TaskId, TaskNode, TaskSubmission};
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use crate::orchestration::events::{self, ColonyEvent, EventReceiver, EventSender};
use crate::orchestration::health::{HealthMonitor, TickReport, WorkerProbe};
use crate::orchestration::registry::RegistrySummary;
use crate::orchestration::scaling::{MetricsSource, ScalingController, ScalingDecision};
use crate::orchestration::scheduler::{Cancellation, DistributionAnalytics, Scheduler};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Submit {
        submission: TaskSubmission,
        reply: Reply<Result<TaskId>>,
    },
    Complete {
        task: TaskId,
        epoch: Option<u64>,
        result: serde_json::Value,
        reply: Reply<Result<()>>,
    },
    Fail {
        task: TaskId,
        epoch: Option<u64>,
        error: String,
        reply: Reply<Result<()>>,
    },
    Cancel {
        task: TaskId,
        reply: Reply<Result<Cancellation>>,
    },
    AcknowledgeCancel {
        task: TaskId,
        reply: Reply<Result<()>>,
    },
    Heartbeat {
        worker: WorkerId,
        at: DateTime<Utc>,
        reply: Reply<Result<()>>,
    },
    Task {
        task: TaskId,
        reply: Reply<Option<TaskNode>>,
    },
    Analytics {
        reply: Reply<DistributionAnalytics>,
    },
    Summary {
        reply: Reply<RegistrySummary>,
    },
    HealthCheck {
        reply: Reply<TickReport>,
    },
    Scale {
        reply: Reply<Vec<ScalingDecision>>,
    },
}

/// Client side of a running colony.
pub struct ColonyHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ColonyHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId> {
        self.request(|reply| Command::Submit { submission, reply })
            .await?
    }

    pub async fn complete(&self, task: &TaskId, result: serde_json::Value) -> Result<()> {
        self.request(|reply| Command::Complete {
            task: task.clone(),
            epoch: None,
            result,
            reply,
        })
        .await?
    }

    /// Complete a task for a specific assignment epoch.
    pub async fn complete_with_epoch(
        &self,
        task: &TaskId,
        epoch: u64,
        result: serde_json::Value,
    ) -> Result<()> {
        self.request(|reply| Command::Complete {
            task: task.clone(),
            epoch: Some(epoch),
            result,
            reply,
        })
        .await?
    }

    pub async fn fail(&self, task: &TaskId, error: &str) -> Result<()> {
        self.request(|reply| Command::Fail {
            task: task.clone(),
            epoch: None,
            error: error.to_string(),
            reply,
        })
        .await?
    }

    /// Fail a task for a specific assignment epoch.
    pub async fn fail_with_epoch(&self, task: &TaskId, epoch: u64, error: &str) -> Result<()> {
        self.request(|reply| Command::Fail {
            task: task.clone(),
            epoch: Some(epoch),
            error: error.to_string(),
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, task: &TaskId) -> Result<Cancellation> {
        self.request(|reply| Command::Cancel {
            task: task.clone(),
            reply,
        })
        .await?
    }

    pub async fn acknowledge_cancel(&self, task: &TaskId) -> Result<()> {
        self.request(|reply| Command::AcknowledgeCancel {
            task: task.clone(),
            reply,
        })
        .await?
    }

    pub async fn heartbeat(&self, worker: &WorkerId) -> Result<()> {
        self.request(|reply| Command::Heartbeat {
            worker: worker.clone(),
            at: Utc::now(),
            reply,
        })
        .await?
    }

    /// Snapshot of one task node.
    pub async fn task(&self, task: &TaskId) -> Result<Option<TaskNode>> {
        self.request(|reply| Command::Task {
            task: task.clone(),
            reply,
        })
        .await
    }

    pub async fn analytics(&self) -> Result<DistributionAnalytics> {
        self.request(|reply| Command::Analytics { reply }).await
    }

    pub async fn summary(&self) -> Result<RegistrySummary> {
        self.request(|reply| Command::Summary { reply }).await
    }

    /// Run a health tick now, outside the interval.
    pub async fn run_health_check(&self) -> Result<TickReport> {
        self.request(|reply| Command::HealthCheck { reply }).await
    }

    /// Run a scaling tick now, outside the interval.
    pub async fn run_scaling(&self) -> Result<Vec<ScalingDecision>> {
        self.request(|reply| Command::Scale { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.join.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.join.await.map_err(|_| Error::ChannelClosed)
    }
}

pub struct Coordinator {
    scheduler: Arc<RwLock<Scheduler>>,
    monitor: Arc<HealthMonitor>,
    scaling: ScalingController,
    metrics: Arc<dyn MetricsSource>,
    health_interval: Duration,
    scaling_interval: Duration,
    event_tx: EventSender,
}

impl Coordinator {
    /// Validate the config, spawn the initial workers, and start the loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: Config,
        probe: Arc<dyn WorkerProbe>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Result<(ColonyHandle, EventReceiver)> {
        config.validate()?;
        let (event_tx, event_rx) = events::channel();

        let mut scheduler = Scheduler::new(&config, event_tx.clone());
        let spawned = scheduler.initialize()?;
        let scheduler = Arc::new(RwLock::new(scheduler));

        let (emergency_tx, emergency_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(
            scheduler.clone(),
            probe,
            config.health.clone(),
            config.recovery.clone(),
            event_tx.clone(),
        )
        .with_emergency_channel(emergency_tx);

        let coordinator = Coordinator {
            scheduler,
            monitor: Arc::new(monitor),
            scaling: ScalingController::new(config.scaling.clone()),
            metrics,
            health_interval: config.health.check_interval(),
            scaling_interval: config.scaling.interval(),
            event_tx,
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(coordinator.run(cmd_rx, emergency_rx, cancel.clone()));

        info!(workers = spawned.len(), "colony started");
        Ok((
            ColonyHandle {
                cmd_tx,
                cancel,
                join,
            },
            event_rx,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut emergencies: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let mut health = tokio::time::interval(self.health_interval);
        let mut scaling = tokio::time::interval(self.scaling_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        scaling.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Intervals fire immediately; the first real tick is one period out.
        health.tick().await;
        scaling.tick().await;

        let mut health_task: Option<JoinHandle<TickReport>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("coordinator cancelled");
                    break;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            debug!("all handles dropped");
                            break;
                        }
                    }
                }
                _ = health.tick() => {
                    if health_task.as_ref().is_some_and(|t| !t.is_finished()) {
                        debug!("previous health tick still running");
                        continue;
                    }
                    let monitor = self.monitor.clone();
                    health_task = Some(tokio::spawn(async move { monitor.run_tick().await }));
                }
                _ = scaling.tick() => {
                    self.scale().await;
                }
                Some(caste) = emergencies.recv() => {
                    self.emergency(&caste).await;
                }
            }
        }

        if let Some(task) = health_task {
            task.abort();
        }
        info!("colony stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { submission, reply } => {
                let result = self.scheduler.write().await.submit(submission);
                let _ = reply.send(result);
            }
            Command::Complete {
                task,
                epoch,
                result,
                reply,
            } => {
                let mut scheduler = self.scheduler.write().await;
                let outcome = match epoch {
                    Some(epoch) => scheduler.complete_with_epoch(&task, epoch, result),
                    None => scheduler.complete_task(&task, result),
                };
                let _ = reply.send(outcome);
            }
            Command::Fail {
                task,
                epoch,
                error,
                reply,
            } => {
                let mut scheduler = self.scheduler.write().await;
                let outcome = match epoch {
                    Some(epoch) => scheduler.fail_with_epoch(&task, epoch, &error),
                    None => scheduler.fail_task(&task, &error),
                };
                let _ = reply.send(outcome);
            }
            Command::Cancel { task, reply } => {
                let _ = reply.send(self.scheduler.write().await.cancel_task(&task));
            }
            Command::AcknowledgeCancel { task, reply } => {
                let _ = reply.send(self.scheduler.write().await.acknowledge_cancel(&task));
            }
            Command::Heartbeat { worker, at, reply } => {
                let _ = reply.send(self.scheduler.write().await.heartbeat(&worker, at));
            }
            Command::Task { task, reply } => {
                let _ = reply.send(self.scheduler.read().await.node(&task).cloned());
            }
            Command::Analytics { reply } => {
                let _ = reply.send(self.scheduler.read().await.distribution_analytics());
            }
            Command::Summary { reply } => {
                let _ = reply.send(self.scheduler.read().await.registry().summary());
            }
            Command::HealthCheck { reply } => {
                let monitor = self.monitor.clone();
                tokio::spawn(async move {
                    let _ = reply.send(monitor.run_tick().await);
                });
            }
            Command::Scale { reply } => {
                let _ = reply.send(self.scale().await);
            }
        }
    }

    async fn scale(&mut self) -> Vec<ScalingDecision> {
        let decisions = {
            let scheduler = self.scheduler.read().await;
            let metrics = self.metrics.collect(&scheduler);
            let counts = scheduler.registry().caste_counts();
            self.scaling.evaluate(&metrics, &counts, Utc::now())
        };
        for decision in decisions.iter().filter(|d| d.is_action()) {
            self.apply(decision).await;
        }
        decisions
    }

    async fn emergency(&mut self, caste: &str) {
        let count = {
            let scheduler = self.scheduler.read().await;
            scheduler
                .registry()
                .caste_counts()
                .into_iter()
                .find(|c| c.name == caste)
        };
        let Some(count) = count else {
            warn!(caste, "emergency for unknown caste");
            return;
        };
        let decision = self.scaling.evaluate_emergency(&count, Utc::now());
        if decision.is_action() {
            self.apply(&decision).await;
        }
    }

    async fn apply(&self, decision: &ScalingDecision) {
        let _ = self.event_tx.send(ColonyEvent::ScalingRecommended {
            decision: decision.clone(),
        });
        if let Err(e) = self.scheduler.write().await.apply_scaling(decision) {
            warn!(caste = %decision.caste, error = %e, "scaling not applied");
        }
    }
}
