//! Optimistic-concurrency retry loop
//!
//! Writes to the cluster store are resource-version gated. On a conflict the
//! whole read-modify-write cycle is replayed from a fresh read; nothing is
//! merged blindly.
//!
//! # Example
//!
//! ```ignore
//! let updated = read_modify_write(
//!     &RetryPolicy::default(),
//!     "pause-rolling-update",
//!     || async { api.get(&name).await },
//!     |mut eds| { set_annotation(&mut eds); Ok(eds) },
//!     |eds| async move { api.replace(&name, &PostParams::default(), &eds).await },
//!     is_conflict,
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Backoff between conflicting attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("{operation} still conflicting after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    #[error("{0}")]
    Failed(E),
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Failed(e) => e,
        }
    }
}

/// Conflict on a resource-version gated write
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Read an object, apply `modify`, write it back; replay on conflict
///
/// Errors other than conflicts (as classified by `conflict`) are returned
/// immediately, including errors raised by `modify`.
pub async fn read_modify_write<T, E, R, RFut, M, W, WFut, C>(
    policy: &RetryPolicy,
    operation: &str,
    mut read: R,
    mut modify: M,
    mut write: W,
    conflict: C,
) -> Result<T, RetryError<E>>
where
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<T, E>>,
    M: FnMut(T) -> Result<T, E>,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let current = read().await.map_err(RetryError::Failed)?;
        let desired = modify(current).map_err(RetryError::Failed)?;

        match write(desired).await {
            Ok(written) => return Ok(written),
            Err(e) if conflict(&e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        operation = %operation,
                        attempt = attempt,
                        error = %e,
                        "Write still conflicting after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflicted, retrying from a fresh read"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}
