//! Clock abstraction for time-dependent rollout decisions
//!
//! Canary durations, slow-start windows and sync throttling all read the
//! current time through `Clock` so tests can drive them deterministically.
//! Also hosts the conversions between chrono and the timestamp formats found
//! on Kubernetes objects.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Trait for getting the current time
///
/// Injected via `Context` to allow tests to control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    #[allow(dead_code)]
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

/// Parse an RFC3339 timestamp stored in a status field
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp the way status fields store it (second precision)
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Convert an apimachinery timestamp through its RFC3339 wire form
pub fn time_to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    value.as_str().and_then(parse_timestamp)
}

/// Build an apimachinery timestamp from its RFC3339 wire form
pub fn utc_to_time(value: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(format_timestamp(value))).ok()
}

/// Convert a chrono duration to std, clamping negatives to zero
pub fn to_std_duration(duration: chrono::Duration) -> std::time::Duration {
    duration.to_std().unwrap_or(std::time::Duration::ZERO)
}
