//! Bounded exponential backoff and per-message attempt accounting.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use super::Disposition;
use crate::cache::{KeyValueStore, attempts_key};
use crate::error::ProcessingError;

/// Exponential backoff with an attempt ceiling.
///
/// The delay after attempt `n` (counting from one) is
/// `min(initial * 2^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Create a policy. A zero attempt ceiling is raised to one.
    #[must_use]
    pub fn new(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial,
            max,
        }
    }

    /// Delay to wait after failed attempt number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Whether attempt number `attempt` was the last one allowed.
    #[must_use]
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The closure receives the attempt number, starting at one. Failures are
/// logged at `warn` and followed by the policy delay.
///
/// # Errors
///
/// Returns the number of attempts made and the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, (u32, E)>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) if policy.is_exhausted(attempt) => return Err((attempt, failure)),
            Err(failure) => {
                let delay = policy.delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis(), error = %failure, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Counts transient failures per logical message and decides when to stop
/// requeueing.
///
/// Counters live in the shared key-value store so every worker sees the same
/// count for a redelivered message.
#[derive(Clone)]
pub struct AttemptTracker {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    ttl: Duration,
}

impl AttemptTracker {
    /// Create a tracker whose counters expire after `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy, ttl: Duration) -> Self {
        Self { store, policy, ttl }
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a transient failure of the message keyed `key`.
    ///
    /// Below the attempt ceiling this waits the backoff delay and answers
    /// [`Disposition::Requeue`]; at the ceiling it clears the counter and
    /// answers [`Disposition::Reject`].
    pub async fn on_transient(&self, key: &str, failure: &ProcessingError) -> Disposition {
        let counter = attempts_key(key);
        let attempt = match self.store.increment(&counter, self.ttl).await {
            Ok(count) => u32::try_from(count).unwrap_or(u32::MAX),
            Err(cache_error) => {
                warn!(error = %cache_error, "attempt counter unavailable, counting as first attempt");
                1
            }
        };

        if self.policy.is_exhausted(attempt) {
            error!(attempt, error = %failure, "giving up after repeated transient failures");
            self.clear(key).await;
            return Disposition::Reject;
        }

        let delay = self.policy.delay(attempt);
        warn!(attempt, delay_ms = delay.as_millis(), error = %failure, "transient failure, requeueing");
        tokio::time::sleep(delay).await;
        Disposition::Requeue
    }

    /// Forget the attempt count for `key`.
    pub async fn clear(&self, key: &str) {
        if let Err(cache_error) = self.store.delete(&attempts_key(key)).await {
            warn!(error = %cache_error, "failed to clear attempt counter");
        }
    }
}

impl std::fmt::Debug for AttemptTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptTracker")
            .field("policy", &self.policy)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
