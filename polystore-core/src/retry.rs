//! Condition-gated retry harness
//!
//! Wraps a backend operation with retry-until-condition-or-exhaustion
//! semantics. Two situations trigger a retry: the operation failed with a
//! transient error, or it succeeded but the caller's condition rejected the
//! result. The second case is what lets callers wait out eventual
//! consistency (e.g. "the listing must contain every manifest entry").
//!
//! The harness is stateless between calls; nothing survives one `execute`.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Sleep growth function: `(previous_sleep, attempt) -> next_sleep`
pub type SleepGrowthFn = fn(Duration, u32) -> Duration;

fn double_sleep(previous: Duration, _attempt: u32) -> Duration {
    previous * 2
}

/// Retry schedule for one wrapped operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first
    pub max_attempts: u32,
    pub initial_sleep: Duration,
    pub growth: SleepGrowthFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_sleep: Duration::from_secs(1),
            growth: double_sleep,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Intended for tests and for
    /// callers that already pace themselves.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_sleep: Duration::ZERO,
            growth: |_, _| Duration::ZERO,
        }
    }
}

/// Runs `operation` under `policy`, gating success on `condition`.
///
/// Permanent errors propagate immediately. Exhausting attempts with the
/// condition still false fails with [`StoreError::ConditionNotMet`];
/// exhausting them under transient errors re-raises the last error wrapped
/// in [`StoreError::RetriesExhausted`] with the attempt count.
pub async fn execute<T, Op, Fut, Cond>(
    mut operation: Op,
    condition: Cond,
    policy: &RetryPolicy,
) -> StoreResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
    Cond: Fn(&T) -> bool,
{
    let mut sleep_time = policy.initial_sleep;
    let mut last_transient: Option<StoreError> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(sleep_time).await;
            sleep_time = (policy.growth)(sleep_time, attempt);
        }

        match operation().await {
            Ok(result) => {
                if condition(&result) {
                    return Ok(result);
                }
                debug!(attempt, "condition not met, retrying");
                last_transient = None;
            }
            Err(err) if err.is_transient() => {
                warn!(attempt, error = %err, "transient error, retrying");
                last_transient = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    match last_transient {
        Some(err) => Err(StoreError::RetriesExhausted {
            attempts: policy.max_attempts,
            source: Box::new(err),
        }),
        None => Err(StoreError::ConditionNotMet(format!(
            "condition still unmet after {} attempts",
            policy.max_attempts
        ))),
    }
}

/// Accepts every result. Use when only transient errors should retry.
pub fn any_result<T>(_: &T) -> bool {
    true
}

/// Ready-made conditions for common listing waits
pub mod conditions {
    /// Listing contains at least `n` entries
    pub fn min_count<T>(n: usize) -> impl Fn(&Vec<T>) -> bool {
        move |results| results.len() >= n
    }

    /// Listing contains exactly `n` entries
    pub fn exact_count<T>(n: usize) -> impl Fn(&Vec<T>) -> bool {
        move |results| results.len() == n
    }
}
