use crate::crd::extended_daemon_set::{
    CanarySpec, CanaryValidationMode, ExtendedDaemonSet, ExtendedDaemonSetStrategy,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::time::Duration;

pub const DEFAULT_MAX_UNAVAILABLE: i32 = 1;
pub const DEFAULT_MAX_POD_SCHEDULER_FAILURE: i32 = 0;
pub const DEFAULT_MAX_PARALLEL_POD_CREATION: i32 = 250;
pub const DEFAULT_SLOW_START_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SLOW_START_ADDITIVE_INCREASE: i32 = 1;
pub const DEFAULT_RECONCILE_FREQUENCY: Duration = Duration::from_secs(10);
pub const DEFAULT_CANARY_REPLICAS: i32 = 1;
pub const DEFAULT_CANARY_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CANARY_NO_RESTARTS_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_AUTO_PAUSE_MAX_RESTARTS: i32 = 2;
pub const DEFAULT_AUTO_FAIL_MAX_RESTARTS: i32 = 5;

/// Longest accepted duration (1 week); guards against typos like "8760h"
const MAX_DURATION: Duration = Duration::from_secs(168 * 3600);

/// Rolling update policy with every default resolved
#[derive(Debug, Clone, PartialEq)]
pub struct RollingUpdatePolicy {
    pub max_unavailable: IntOrString,
    pub max_pod_scheduler_failure: IntOrString,
    pub max_parallel_pod_creation: i32,
    pub slow_start_interval: chrono::Duration,
    pub slow_start_additive_increase: IntOrString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoPausePolicy {
    pub enabled: bool,
    pub max_restarts: i32,
    pub max_slow_start_duration: Option<chrono::Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoFailPolicy {
    pub enabled: bool,
    pub max_restarts: i32,
    pub max_restarts_duration: Option<chrono::Duration>,
    pub canary_timeout: Option<chrono::Duration>,
}

/// Canary policy with every default resolved
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryPolicy {
    pub replicas: IntOrString,
    pub duration: Option<chrono::Duration>,
    pub no_restarts_duration: Option<chrono::Duration>,
    pub node_selector: Option<LabelSelector>,
    pub node_anti_affinity_keys: Vec<String>,
    pub auto_pause: AutoPausePolicy,
    pub auto_fail: AutoFailPolicy,
    pub validation_mode: CanaryValidationMode,
}

/// Strategy of an ExtendedDaemonSet after defaulting and validation
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPolicy {
    pub rolling_update: RollingUpdatePolicy,
    pub canary: Option<CanaryPolicy>,
    pub reconcile_frequency: chrono::Duration,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        // The defaults always resolve; an empty strategy cannot fail validation
        resolve_strategy(
            &ExtendedDaemonSetStrategy::default(),
            CanaryValidationMode::Auto,
        )
        .unwrap_or_else(|_| StrategyPolicy {
            rolling_update: RollingUpdatePolicy {
                max_unavailable: IntOrString::Int(DEFAULT_MAX_UNAVAILABLE),
                max_pod_scheduler_failure: IntOrString::Int(DEFAULT_MAX_POD_SCHEDULER_FAILURE),
                max_parallel_pod_creation: DEFAULT_MAX_PARALLEL_POD_CREATION,
                slow_start_interval: chrono::Duration::seconds(60),
                slow_start_additive_increase: IntOrString::Int(
                    DEFAULT_SLOW_START_ADDITIVE_INCREASE,
                ),
            },
            canary: None,
            reconcile_frequency: chrono::Duration::seconds(10),
        })
    }
}

/// Validate an ExtendedDaemonSet and resolve its strategy
///
/// Enforces runtime constraints the CRD schema cannot express:
/// - the pod template has at least one container
/// - every duration parses and integer-or-percent values are well formed
/// - `maxParallelPodCreation >= 1`
/// - with both automatic policies enabled, the fail restart threshold is
///   strictly above the pause threshold
/// - the slow start grace window is shorter than the canary duration
///
/// # Returns
/// * `Ok(StrategyPolicy)` - Validation passed, defaults applied
/// * `Err(String)` - Validation error message
pub fn validate_extended_daemon_set(
    eds: &ExtendedDaemonSet,
    default_mode: CanaryValidationMode,
) -> Result<StrategyPolicy, String> {
    let has_containers = eds
        .spec
        .template
        .spec
        .as_ref()
        .map(|s| !s.containers.is_empty())
        .unwrap_or(false);
    if !has_containers {
        return Err("spec.template.spec.containers must have at least one container".to_string());
    }

    resolve_strategy(&eds.spec.strategy, default_mode)
}

/// Apply defaults to a strategy and validate the result
pub fn resolve_strategy(
    strategy: &ExtendedDaemonSetStrategy,
    default_mode: CanaryValidationMode,
) -> Result<StrategyPolicy, String> {
    let ru = &strategy.rolling_update;

    let max_unavailable = ru
        .max_unavailable
        .clone()
        .unwrap_or(IntOrString::Int(DEFAULT_MAX_UNAVAILABLE));
    check_int_or_percent("spec.strategy.rollingUpdate.maxUnavailable", &max_unavailable)?;

    let max_pod_scheduler_failure = ru
        .max_pod_scheduler_failure
        .clone()
        .unwrap_or(IntOrString::Int(DEFAULT_MAX_POD_SCHEDULER_FAILURE));
    check_int_or_percent(
        "spec.strategy.rollingUpdate.maxPodSchedulerFailure",
        &max_pod_scheduler_failure,
    )?;

    let max_parallel_pod_creation = ru
        .max_parallel_pod_creation
        .unwrap_or(DEFAULT_MAX_PARALLEL_POD_CREATION);
    if max_parallel_pod_creation < 1 {
        return Err(format!(
            "spec.strategy.rollingUpdate.maxParallelPodCreation must be >= 1, got {}",
            max_parallel_pod_creation
        ));
    }

    let slow_start_interval = duration_field(
        "spec.strategy.rollingUpdate.slowStartIntervalDuration",
        ru.slow_start_interval_duration.as_deref(),
    )?
    .unwrap_or(DEFAULT_SLOW_START_INTERVAL);

    let slow_start_additive_increase = ru
        .slow_start_additive_increase
        .clone()
        .unwrap_or(IntOrString::Int(DEFAULT_SLOW_START_ADDITIVE_INCREASE));
    check_int_or_percent(
        "spec.strategy.rollingUpdate.slowStartAdditiveIncrease",
        &slow_start_additive_increase,
    )?;

    let reconcile_frequency = duration_field(
        "spec.strategy.reconcileFrequency",
        strategy.reconcile_frequency.as_deref(),
    )?
    .unwrap_or(DEFAULT_RECONCILE_FREQUENCY);

    let canary = match &strategy.canary {
        Some(canary) => Some(resolve_canary(canary, default_mode)?),
        None => None,
    };

    Ok(StrategyPolicy {
        rolling_update: RollingUpdatePolicy {
            max_unavailable,
            max_pod_scheduler_failure,
            max_parallel_pod_creation,
            slow_start_interval: to_chrono(slow_start_interval),
            slow_start_additive_increase,
        },
        canary,
        reconcile_frequency: to_chrono(reconcile_frequency),
    })
}

fn resolve_canary(
    canary: &CanarySpec,
    default_mode: CanaryValidationMode,
) -> Result<CanaryPolicy, String> {
    let validation_mode = canary.validation_mode.unwrap_or(default_mode);

    let replicas = canary
        .replicas
        .clone()
        .unwrap_or(IntOrString::Int(DEFAULT_CANARY_REPLICAS));
    check_int_or_percent("spec.strategy.canary.replicas", &replicas)?;

    let mut duration = duration_field("spec.strategy.canary.duration", canary.duration.as_deref())?;
    let mut no_restarts_duration = duration_field(
        "spec.strategy.canary.noRestartsDuration",
        canary.no_restarts_duration.as_deref(),
    )?;
    match validation_mode {
        CanaryValidationMode::Auto => {
            duration.get_or_insert(DEFAULT_CANARY_DURATION);
            no_restarts_duration.get_or_insert(DEFAULT_CANARY_NO_RESTARTS_DURATION);
        }
        CanaryValidationMode::Manual => {
            if duration.is_some() {
                return Err(
                    "spec.strategy.canary.duration cannot be set with validationMode manual"
                        .to_string(),
                );
            }
        }
    }

    let pause = canary.auto_pause.clone().unwrap_or_default();
    let auto_pause = AutoPausePolicy {
        enabled: pause.enabled.unwrap_or(true),
        max_restarts: pause.max_restarts.unwrap_or(DEFAULT_AUTO_PAUSE_MAX_RESTARTS),
        max_slow_start_duration: duration_field(
            "spec.strategy.canary.autoPause.maxSlowStartDuration",
            pause.max_slow_start_duration.as_deref(),
        )?
        .map(to_chrono),
    };

    let fail = canary.auto_fail.clone().unwrap_or_default();
    let auto_fail = AutoFailPolicy {
        enabled: fail.enabled.unwrap_or(true),
        max_restarts: fail.max_restarts.unwrap_or(DEFAULT_AUTO_FAIL_MAX_RESTARTS),
        max_restarts_duration: duration_field(
            "spec.strategy.canary.autoFail.maxRestartsDuration",
            fail.max_restarts_duration.as_deref(),
        )?
        .map(to_chrono),
        canary_timeout: duration_field(
            "spec.strategy.canary.autoFail.canaryTimeout",
            fail.canary_timeout.as_deref(),
        )?
        .map(to_chrono),
    };

    if auto_pause.max_restarts < 0 || auto_fail.max_restarts < 0 {
        return Err("spec.strategy.canary maxRestarts must be >= 0".to_string());
    }

    if auto_pause.enabled && auto_fail.enabled && auto_fail.max_restarts <= auto_pause.max_restarts
    {
        return Err(format!(
            "spec.strategy.canary.autoFail.maxRestarts ({}) must be greater than autoPause.maxRestarts ({})",
            auto_fail.max_restarts, auto_pause.max_restarts
        ));
    }

    if let (Some(slow_start), Some(duration)) = (auto_pause.max_slow_start_duration, duration) {
        if auto_pause.enabled && slow_start >= to_chrono(duration) {
            return Err(
                "spec.strategy.canary.autoPause.maxSlowStartDuration must be shorter than canary.duration"
                    .to_string(),
            );
        }
    }

    if let (Some(timeout), Some(duration)) = (auto_fail.canary_timeout, duration) {
        if auto_fail.enabled && timeout <= to_chrono(duration) {
            return Err(
                "spec.strategy.canary.autoFail.canaryTimeout must be longer than canary.duration"
                    .to_string(),
            );
        }
    }

    Ok(CanaryPolicy {
        replicas,
        duration: duration.map(to_chrono),
        no_restarts_duration: no_restarts_duration.map(to_chrono),
        node_selector: canary.node_selector.clone(),
        node_anti_affinity_keys: canary.node_anti_affinity_keys.clone(),
        auto_pause,
        auto_fail,
        validation_mode,
    })
}

fn duration_field(field: &str, value: Option<&str>) -> Result<Option<Duration>, String> {
    match value {
        None => Ok(None),
        Some(raw) => parse_duration(raw)
            .map(Some)
            .ok_or_else(|| format!("{} invalid duration: {}", field, raw)),
    }
}

fn check_int_or_percent(field: &str, value: &IntOrString) -> Result<(), String> {
    resolve_int_or_percent(value, 100).map(|_| ()).map_err(|e| {
        format!(
            "{} invalid value: {} (must be a non-negative number or a percentage like '25%')",
            field, e
        )
    })
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

/// Resolve an integer-or-percent value against `total`
///
/// Percentages are rounded up so that any non-zero percentage of a
/// non-empty fleet yields at least one.
///
/// # Examples
/// ```ignore
/// assert_eq!(resolve_int_or_percent(&IntOrString::String("25%".into()), 10), Ok(3));
/// assert_eq!(resolve_int_or_percent(&IntOrString::Int(5), 10), Ok(5));
/// ```
pub fn resolve_int_or_percent(value: &IntOrString, total: i32) -> Result<i32, String> {
    match value {
        IntOrString::Int(abs) if *abs >= 0 => Ok(*abs),
        IntOrString::Int(abs) => Err(abs.to_string()),
        IntOrString::String(raw) => {
            if let Some(percent_str) = raw.strip_suffix('%') {
                match percent_str.parse::<i32>() {
                    Ok(percent) if (0..=100).contains(&percent) => {
                        Ok(((total as f64 * percent as f64) / 100.0).ceil() as i32)
                    }
                    _ => Err(raw.clone()),
                }
            } else {
                match raw.parse::<i32>() {
                    Ok(abs) if abs >= 0 => Ok(abs),
                    _ => Err(raw.clone()),
                }
            }
        }
    }
}

/// Parse a duration string like "30s", "5m", "2h" or "1m30s"
///
/// # Validation Rules
/// - Units: `s`, `m`, `h`; components may be chained ("1h30m")
/// - Zero duration is rejected (minimum 1s)
/// - Total limited to 1 week (168h)
///
/// # Returns
/// Some(Duration) if parse successful and within limits, None if invalid or out of range
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    if duration_str.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    for ch in duration_str.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value: u64 = number.parse().ok()?;
        number.clear();
        let unit_secs = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit_secs)?)?;
    }

    // Trailing digits without a unit
    if !number.is_empty() {
        return None;
    }

    if total == 0 || total > MAX_DURATION.as_secs() {
        return None;
    }

    Some(Duration::from_secs(total))
}
