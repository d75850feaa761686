//! Adaptive scaling.
//!
//! The `ScalingController` turns a [`MetricsSnapshot`] into one
//! [`ScalingDecision`] per caste. Where the snapshot comes from is a
//! [`MetricsSource`]; [`SchedulerMetrics`] derives one from scheduler state.
//!
//! Scale-up fires on any one of: utilization above the high watermark, caste
//! queue depth above the max threshold, response time above the max. Scale-down
//! needs all three quiet at once. A caste that acted stays in cooldown for
//! `cooldown_secs`; emergencies skip the cooldown.

use crate::config::ScalingConfig;
use crate::orchestration::registry::CasteCount;
use crate::orchestration::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// Telemetry consumed by the scaling controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Total ready-queue depth.
    pub queue_depth: usize,
    /// Mean time ready work waits for a worker.
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub per_caste_utilization: BTreeMap<String, f64>,
    /// Ready-queue depth per target caste. When empty, every caste falls
    /// back to `queue_depth`.
    #[serde(default)]
    pub per_caste_queue_depth: BTreeMap<String, usize>,
    pub captured_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn utilization(&self, caste: &str) -> f64 {
        self.per_caste_utilization.get(caste).copied().unwrap_or(0.0)
    }

    pub fn queue_depth_for(&self, caste: &str) -> usize {
        if self.per_caste_queue_depth.is_empty() {
            return self.queue_depth;
        }
        self.per_caste_queue_depth.get(caste).copied().unwrap_or(0)
    }
}

/// Pluggable telemetry provider.
pub trait MetricsSource: Send + Sync {
    fn collect(&self, scheduler: &Scheduler) -> MetricsSnapshot;
}

/// Metrics computed from the scheduler itself. CPU and memory are not
/// observable from here and report 0. Response time is how long ready
/// tasks wait for a worker, not how long they run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerMetrics;

impl MetricsSource for SchedulerMetrics {
    fn collect(&self, scheduler: &Scheduler) -> MetricsSnapshot {
        let registry = scheduler.registry();
        let per_caste_utilization = registry
            .caste_names()
            .iter()
            .map(|caste| {
                let active = registry.active_count(caste);
                let working = registry.working_count(caste);
                let utilization = if active == 0 {
                    0.0
                } else {
                    working as f64 / active as f64
                };
                (caste.clone(), utilization)
            })
            .collect();

        let analytics = scheduler.distribution_analytics();
        let finished = analytics.completed + analytics.failed;
        let error_rate = if finished == 0 {
            0.0
        } else {
            analytics.failed as f64 / finished as f64
        };

        let now = Utc::now();
        MetricsSnapshot {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            queue_depth: scheduler.queue_len(),
            avg_response_time_ms: scheduler.average_queue_wait(now).as_secs_f64() * 1000.0,
            error_rate,
            per_caste_utilization,
            per_caste_queue_depth: scheduler.queue_depth_by_caste(),
            captured_at: now,
        }
    }
}

/// A fixed snapshot, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics(pub MetricsSnapshot);

impl MetricsSource for StaticMetrics {
    fn collect(&self, _scheduler: &Scheduler) -> MetricsSnapshot {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
            ScalingAction::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub caste: String,
    pub action: ScalingAction,
    pub current_count: usize,
    pub target_count: usize,
    pub reason: String,
}

impl ScalingDecision {
    fn hold(count: &CasteCount, reason: String) -> Self {
        Self {
            caste: count.name.clone(),
            action: ScalingAction::None,
            current_count: count.current,
            target_count: count.current,
            reason,
        }
    }

    pub fn is_action(&self) -> bool {
        self.action != ScalingAction::None
    }
}

pub struct ScalingController {
    config: ScalingConfig,
    last_action: HashMap<String, DateTime<Utc>>,
}

impl ScalingController {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_action: HashMap::new(),
        }
    }

    /// One decision per caste, in the order given.
    pub fn evaluate(
        &mut self,
        metrics: &MetricsSnapshot,
        castes: &[CasteCount],
        now: DateTime<Utc>,
    ) -> Vec<ScalingDecision> {
        castes
            .iter()
            .map(|count| {
                let decision = self.decide(metrics, count, now);
                if decision.is_action() {
                    self.last_action.insert(count.name.clone(), now);
                    info!(
                        caste = %decision.caste,
                        action = %decision.action,
                        from = decision.current_count,
                        to = decision.target_count,
                        reason = %decision.reason,
                        "scaling decision"
                    );
                } else {
                    debug!(caste = %decision.caste, reason = %decision.reason, "no scaling");
                }
                decision
            })
            .collect()
    }

    /// Immediate capacity review for an escalated caste. Ignores cooldown.
    pub fn evaluate_emergency(&mut self, count: &CasteCount, now: DateTime<Utc>) -> ScalingDecision {
        if count.current >= count.max {
            return ScalingDecision::hold(count, "emergency: caste already at max".to_string());
        }
        self.last_action.insert(count.name.clone(), now);
        let decision = ScalingDecision {
            caste: count.name.clone(),
            action: ScalingAction::ScaleUp,
            current_count: count.current,
            target_count: self.scale_up_target(count),
            reason: "emergency: recovery escalated".to_string(),
        };
        info!(caste = %decision.caste, to = decision.target_count, "emergency scale-up");
        decision
    }

    /// Seconds of cooldown left for a caste, if any.
    pub fn cooldown_remaining(&self, caste: &str, now: DateTime<Utc>) -> Option<u64> {
        let last = self.last_action.get(caste)?;
        let elapsed = (now - *last).num_seconds().max(0) as u64;
        let cooldown = self.config.cooldown_secs;
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    fn decide(&self, metrics: &MetricsSnapshot, count: &CasteCount, now: DateTime<Utc>) -> ScalingDecision {
        let utilization = metrics.utilization(&count.name);
        let depth = metrics.queue_depth_for(&count.name);
        let response = metrics.avg_response_time_ms;
        let cfg = &self.config;

        let mut pressure = Vec::new();
        if utilization > cfg.high_utilization {
            pressure.push(format!("utilization {:.2} > {:.2}", utilization, cfg.high_utilization));
        }
        if depth > cfg.max_queue_depth {
            pressure.push(format!("queue depth {} > {}", depth, cfg.max_queue_depth));
        }
        if response > cfg.max_response_time_ms {
            pressure.push(format!(
                "response time {:.0}ms > {:.0}ms",
                response, cfg.max_response_time_ms
            ));
        }
        let quiet = utilization < cfg.low_utilization
            && depth < cfg.min_queue_depth
            && response <= cfg.max_response_time_ms;

        let (action, target, reason) = if !pressure.is_empty() {
            if count.current >= count.max {
                return ScalingDecision::hold(count, format!("at max; {}", pressure.join("; ")));
            }
            (ScalingAction::ScaleUp, self.scale_up_target(count), pressure.join("; "))
        } else if quiet {
            if count.current <= count.min {
                return ScalingDecision::hold(count, "at min".to_string());
            }
            (
                ScalingAction::ScaleDown,
                self.scale_down_target(count),
                format!("utilization {:.2}, queue depth {} both low", utilization, depth),
            )
        } else {
            return ScalingDecision::hold(count, "within thresholds".to_string());
        };

        if let Some(remaining) = self.cooldown_remaining(&count.name, now) {
            return ScalingDecision::hold(count, format!("cooldown, {}s remaining", remaining));
        }
        ScalingDecision {
            caste: count.name.clone(),
            action,
            current_count: count.current,
            target_count: target,
            reason,
        }
    }

    fn scale_up_target(&self, count: &CasteCount) -> usize {
        let grown = (count.current as f64 * self.config.scale_factor).ceil() as usize;
        grown.max(count.current + 1).max(count.min).min(count.max)
    }

    fn scale_down_target(&self, count: &CasteCount) -> usize {
        let shrunk = (count.current as f64 / self.config.scale_factor).floor() as usize;
        shrunk.max(count.min).min(count.max)
    }
}
