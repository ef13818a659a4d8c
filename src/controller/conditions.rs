//! Status condition ledger
//!
//! Append/update logic for the ordered condition lists carried by
//! ExtendedDaemonSet and ExtendedDaemonSetReplicaSet statuses. Pure functions
//! over in-memory state; callers persist the result with their status write.

use super::clock::{format_timestamp, parse_timestamp};
use crate::crd::condition::{Condition, ConditionStatus, ConditionType};
use chrono::{DateTime, Utc};

/// Controls how `upsert` treats absent conditions and update timestamps
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Skip creating a condition whose first recorded status would be False
    pub ignore_false_if_not_exist: bool,
    /// Refresh `lastUpdateTime` on every write
    pub support_last_update: bool,
}

impl UpdateOptions {
    pub fn tracked() -> Self {
        UpdateOptions {
            ignore_false_if_not_exist: true,
            support_last_update: true,
        }
    }
}

/// Insert or update the condition of `type_`
///
/// - existing: `lastTransitionTime` moves only when the status changes;
///   reason and message are refreshed only when the new status is True
/// - absent: created when the status is True, or when
///   `ignore_false_if_not_exist` is false
pub fn upsert(
    conditions: &mut Vec<Condition>,
    now: DateTime<Utc>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    opts: UpdateOptions,
) {
    let now_str = format_timestamp(now);

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.status = status;
            existing.last_transition_time = Some(now_str.clone());
        }
        if opts.support_last_update {
            existing.last_update_time = Some(now_str);
        }
        if status == ConditionStatus::True {
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        return;
    }

    if status == ConditionStatus::True || !opts.ignore_false_if_not_exist {
        conditions.push(Condition {
            type_,
            status,
            last_transition_time: Some(now_str.clone()),
            last_update_time: opts.support_last_update.then_some(now_str),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find(conditions, type_).map(|c| c.is_true()).unwrap_or(false)
}

/// `lastTransitionTime` of a condition that is currently True
pub fn true_since(conditions: &[Condition], type_: ConditionType) -> Option<DateTime<Utc>> {
    find(conditions, type_)
        .filter(|c| c.is_true())
        .and_then(|c| c.last_transition_time.as_deref())
        .and_then(parse_timestamp)
}

/// `lastUpdateTime` of a condition, falling back to its transition time
pub fn last_update(conditions: &[Condition], type_: ConditionType) -> Option<DateTime<Utc>> {
    find(conditions, type_).and_then(|c| {
        c.last_update_time
            .as_deref()
            .or(c.last_transition_time.as_deref())
            .and_then(parse_timestamp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_absent_false_condition_is_skipped_when_ignored() {
        let mut conditions = Vec::new();

        upsert(
            &mut conditions,
            t0(),
            ConditionType::CanaryPaused,
            ConditionStatus::False,
            "",
            "",
            UpdateOptions::tracked(),
        );

        assert!(conditions.is_empty());
    }

    #[test]
    fn test_absent_false_condition_is_recorded_on_opt_in() {
        let mut conditions = Vec::new();

        upsert(
            &mut conditions,
            t0(),
            ConditionType::CanaryFailed,
            ConditionStatus::False,
            "",
            "",
            UpdateOptions::default(),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].last_update_time, None);
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let mut conditions = Vec::new();
        let opts = UpdateOptions::tracked();
        upsert(&mut conditions, t0(), ConditionType::Active, ConditionStatus::True, "", "", opts);

        let later = t0() + chrono::Duration::minutes(5);
        upsert(&mut conditions, later, ConditionType::Active, ConditionStatus::True, "", "", opts);

        assert_eq!(true_since(&conditions, ConditionType::Active), Some(t0()));
        assert_eq!(last_update(&conditions, ConditionType::Active), Some(later));

        let even_later = later + chrono::Duration::minutes(5);
        upsert(
            &mut conditions,
            even_later,
            ConditionType::Active,
            ConditionStatus::False,
            "",
            "",
            opts,
        );

        assert_eq!(
            find(&conditions, ConditionType::Active)
                .and_then(|c| c.last_transition_time.clone()),
            Some(format_timestamp(even_later))
        );
        assert_eq!(true_since(&conditions, ConditionType::Active), None);
    }

    #[test]
    fn test_clearing_keeps_failure_reason() {
        let mut conditions = Vec::new();
        let opts = UpdateOptions::tracked();
        upsert(
            &mut conditions,
            t0(),
            ConditionType::PodCannotStart,
            ConditionStatus::True,
            "CreateContainerConfigError",
            "pod agent-abc cannot start",
            opts,
        );

        upsert(
            &mut conditions,
            t0(),
            ConditionType::PodCannotStart,
            ConditionStatus::False,
            "",
            "",
            opts,
        );

        let condition = find(&conditions, ConditionType::PodCannotStart).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "CreateContainerConfigError");
        assert_eq!(condition.message, "pod agent-abc cannot start");
    }

    #[test]
    fn test_conditions_keep_insertion_order() {
        let mut conditions = Vec::new();
        let opts = UpdateOptions::tracked();
        upsert(&mut conditions, t0(), ConditionType::Active, ConditionStatus::True, "", "", opts);
        upsert(&mut conditions, t0(), ConditionType::Canary, ConditionStatus::True, "", "", opts);
        upsert(&mut conditions, t0(), ConditionType::Active, ConditionStatus::False, "", "", opts);

        let types: Vec<_> = conditions.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ConditionType::Active, ConditionType::Canary]);
    }
}
