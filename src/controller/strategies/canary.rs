//! Canary evaluation
//!
//! Runs the candidate generation on the canary nodes and watches its pods.
//! Restart and start-failure signals drive the auto pause and auto fail
//! policies; the ExtendedDaemonSet controller reads the resulting
//! `CanaryPaused` and `CanaryFailed` conditions.

use super::{
    is_owned_by, is_pod_up_to_date, pod_has_label, unscheduled_nodes, ReplicaSetStrategy,
    StrategyError, StrategyParams, StrategyResult, REQUEUE_PROMPTLY,
};
use crate::controller::clock::{parse_timestamp, time_to_utc};
use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::intent::CanaryIntent;
use crate::controller::pod::{
    cannot_start, highest_restart_count, is_pod_available, is_pod_ready, is_terminating,
    most_recent_restart, pending_create, pod_name, start_time,
};
use crate::controller::validation::CanaryPolicy;
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::extended_daemon_set::CanaryReason;
use crate::crd::keys::{ERS_CANARY_LABEL, TRUE_VALUE};
use crate::crd::replica_set::ReplicaSetRole;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

pub struct CanaryStrategy;

impl ReplicaSetStrategy for CanaryStrategy {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn plan(&self, params: StrategyParams<'_>) -> Result<StrategyResult, StrategyError> {
        let replica_set_name = params
            .replica_set
            .metadata
            .name
            .clone()
            .unwrap_or_default();
        let canary = params
            .policy
            .canary
            .as_ref()
            .ok_or_else(|| StrategyError::MissingCanaryPolicy(replica_set_name.clone()))?;
        let now = params.now;

        let mut status = params.status.clone();
        status.status = ReplicaSetRole::Canary;

        let mut verdict = Verdict::from_params(&params);

        let mut result = StrategyResult::default();
        let mut to_create = Vec::new();
        let mut healthy_pods: Vec<&Pod> = Vec::new();
        let mut need_requeue = false;
        let (mut desired, mut current, mut available, mut ready) = (0, 0, 0, 0);

        let canary_items = params
            .nodes
            .iter()
            .filter(|item| params.canary_nodes.iter().any(|n| n == item.name()));

        for item in canary_items.clone() {
            desired += 1;
            let Some(pod) = &item.pod else {
                to_create.push(item.name().to_string());
                continue;
            };
            if is_terminating(pod) {
                need_requeue = true;
                continue;
            }
            if !is_pod_up_to_date(params.replica_set, pod, item) {
                result.pods_to_delete.push(pod_name(pod).to_string());
                continue;
            }

            current += 1;
            if is_pod_available(pod, 0, now) {
                available += 1;
            }
            if is_pod_ready(pod) {
                ready += 1;
            }
            healthy_pods.push(pod);
        }

        let signals = PodSignals::collect(&healthy_pods, canary, now);
        verdict.evaluate(&signals, canary, &params, now);
        verdict.write_conditions(&mut status, &signals, now);

        status.desired = desired;
        status.current = current;
        status.available = available;
        status.ready = ready;

        if !to_create.is_empty() && !verdict.is_paused && !verdict.is_failed {
            result.pods_to_create = to_create;
            need_requeue = true;
        }

        result.pods_to_label = canary_items
            .clone()
            .filter_map(|item| item.pod.as_ref())
            .filter(|pod| {
                is_owned_by(pod, params.replica_set)
                    && !pod_has_label(pod, ERS_CANARY_LABEL, Some(TRUE_VALUE))
            })
            .map(|pod| pod_name(pod).to_string())
            .collect();
        result.unscheduled_nodes = unscheduled_nodes(canary_items);

        if need_requeue || (!verdict.is_failed && !verdict.is_paused && desired != ready) {
            result.requeue(REQUEUE_PROMPTLY);
        }

        result.is_paused = verdict.is_paused;
        result.is_failed = verdict.is_failed;
        result.status = status;

        Ok(result)
    }
}

/// Health signals aggregated over the up-to-date canary pods
#[derive(Debug, Default)]
struct PodSignals {
    /// Highest restart count of a single container, with its reason
    max_restarts: i32,
    max_restarts_reason: String,
    /// Most recent restart across pods, with its status message
    last_restart: Option<(DateTime<Utc>, String)>,
    /// Start failure of any pod, with its status message
    cannot_start: Option<(CanaryReason, String)>,
    /// Start failure that outlasted the slow start window
    cannot_start_overdue: Option<CanaryReason>,
}

impl PodSignals {
    fn collect(pods: &[&Pod], canary: &CanaryPolicy, now: DateTime<Utc>) -> Self {
        let slow_start = canary.auto_pause.max_slow_start_duration;
        let mut signals = PodSignals::default();

        for pod in pods {
            let name = pod_name(pod);
            let (restarts, reason) = highest_restart_count(pod);
            if restarts > signals.max_restarts {
                signals.max_restarts = restarts;
                signals.max_restarts_reason = reason;
            }
            if restarts > 0 {
                if let Some((at, reason)) = most_recent_restart(pod) {
                    if signals.last_restart.as_ref().map(|(t, _)| at > *t).unwrap_or(true) {
                        signals.last_restart =
                            Some((at, format!("Pod {} restarting with reason: {}", name, reason)));
                    }
                }
            }

            let started = start_time(pod).or_else(|| {
                pod.metadata
                    .creation_timestamp
                    .as_ref()
                    .and_then(time_to_utc)
            });
            let window_exceeded = match (slow_start, started) {
                (Some(window), Some(started)) => now > started + window,
                (Some(_), None) => false,
                (None, _) => true,
            };

            let failure = cannot_start(pod).or_else(|| {
                let stuck = canary.auto_pause.enabled
                    && slow_start.is_some()
                    && window_exceeded
                    && pending_create(pod);
                stuck.then(|| {
                    info!(
                        pod = name,
                        "Canary pod still creating past the slow start window"
                    );
                    CanaryReason::SlowStartTimeoutExceeded
                })
            });
            if let Some(reason) = failure {
                if window_exceeded {
                    signals.cannot_start_overdue = Some(reason);
                }
                // Overdue pods take precedence in the reported reason
                if window_exceeded || signals.cannot_start_overdue.is_none() {
                    signals.cannot_start = Some((
                        reason,
                        format!("Pod {} cannot start with reason: {}", name, reason),
                    ));
                }
            }
        }

        signals
    }
}

/// Pause/fail decision for one pass
#[derive(Debug)]
struct Verdict {
    is_failed: bool,
    failed_reason: String,
    is_paused: bool,
    paused_reason: String,
    is_unpaused: bool,
}

impl Verdict {
    fn from_params(params: &StrategyParams<'_>) -> Self {
        let replica_set = params.replica_set;
        let failed = replica_set.condition(ConditionType::CanaryFailed).filter(|c| c.is_true());
        let paused_condition = replica_set
            .condition(ConditionType::CanaryPaused)
            .filter(|c| c.is_true());

        let (is_paused, paused_reason, is_unpaused) = match &params.intent.canary {
            CanaryIntent::Paused { reason } => (true, reason.clone(), false),
            CanaryIntent::Unpaused => (false, String::new(), true),
            CanaryIntent::None => match paused_condition {
                Some(c) => (true, c.reason.clone(), false),
                None => (false, String::new(), false),
            },
        };

        Verdict {
            is_failed: failed.is_some(),
            failed_reason: failed.map(|c| c.reason.clone()).unwrap_or_default(),
            is_paused,
            paused_reason,
            is_unpaused,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.is_failed = true;
        self.failed_reason = reason.into();
        info!(reason = %self.failed_reason, "Canary failed");
    }

    fn pause(&mut self, reason: impl Into<String>) {
        self.is_paused = true;
        self.paused_reason = reason.into();
        info!(reason = %self.paused_reason, "Canary paused");
    }

    /// Apply the decision order; a failed canary is never re-evaluated
    fn evaluate(
        &mut self,
        signals: &PodSignals,
        canary: &CanaryPolicy,
        params: &StrategyParams<'_>,
        now: DateTime<Utc>,
    ) {
        if self.is_failed {
            return;
        }
        let auto_fail = &canary.auto_fail;
        let auto_pause = &canary.auto_pause;

        let restarting_for = conditions::find(&params.status.conditions, ConditionType::PodRestarting)
            .and_then(|c| {
                let since = parse_timestamp(c.last_transition_time.as_deref()?)?;
                let last = parse_timestamp(c.last_update_time.as_deref()?)?;
                Some(last - since)
            });
        let canary_for = conditions::true_since(&params.status.conditions, ConditionType::Canary)
            .map(|since| now - since);

        if auto_fail.enabled && signals.max_restarts > auto_fail.max_restarts {
            self.fail(signals.max_restarts_reason.clone());
        } else if auto_fail.enabled
            && matches!((auto_fail.max_restarts_duration, restarting_for), (Some(max), Some(span)) if span > max)
        {
            self.fail(CanaryReason::RestartsTimeoutExceeded.as_str());
        } else if auto_fail.enabled
            && matches!((auto_fail.canary_timeout, canary_for), (Some(max), Some(span)) if span > max)
        {
            self.fail(CanaryReason::TimeoutExceeded.as_str());
        } else if params.intent.failed {
            self.fail(CanaryReason::Manual.as_str());
        } else if self.is_unpaused {
            self.is_paused = false;
            self.paused_reason.clear();
        } else if auto_pause.enabled {
            if let Some(reason) = signals.cannot_start_overdue {
                self.pause(reason.as_str());
            } else if signals.max_restarts > auto_pause.max_restarts {
                self.pause(signals.max_restarts_reason.clone());
            }
        }
    }

    fn write_conditions(
        &self,
        status: &mut crate::crd::replica_set::ExtendedDaemonSetReplicaSetStatus,
        signals: &PodSignals,
        now: DateTime<Utc>,
    ) {
        let opts = UpdateOptions {
            ignore_false_if_not_exist: false,
            support_last_update: true,
        };
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::CanaryFailed,
            ConditionStatus::from_bool(self.is_failed),
            &self.failed_reason,
            "",
            opts,
        );
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::CanaryPaused,
            ConditionStatus::from_bool(self.is_paused),
            &self.paused_reason,
            "",
            opts,
        );

        let cannot_start_reason = signals
            .cannot_start
            .as_ref()
            .map(|(r, _)| r.as_str())
            .unwrap_or_default();

        let last_recorded =
            conditions::last_update(&status.conditions, ConditionType::PodRestarting);
        if let Some((at, message)) = &signals.last_restart {
            if last_recorded.map(|t| *at > t).unwrap_or(true) {
                conditions::upsert(
                    &mut status.conditions,
                    *at,
                    ConditionType::PodRestarting,
                    ConditionStatus::True,
                    cannot_start_reason,
                    message,
                    opts,
                );
            }
        }

        let (cannot_start_status, message) = match &signals.cannot_start {
            Some((_, message)) => (ConditionStatus::True, message.as_str()),
            None => (ConditionStatus::False, ""),
        };
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::PodCannotStart,
            cannot_start_status,
            cannot_start_reason,
            message,
            opts,
        );
    }
}
