//! Short-lived per-machine locks in the key-value store.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{KeyValueStore, machine_lock_key};
use crate::error::{ConcurrencyError, ProcessingError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A held lock on one machine.
///
/// The lock value is a random token so that only the holder can release it;
/// a holder that dies leaves the lock to expire with its TTL.
pub struct MachineLock<'a> {
    store: &'a dyn KeyValueStore,
    key: String,
    token: String,
}

impl<'a> MachineLock<'a> {
    /// Acquire the lock for `machine_id`, polling for up to `wait`.
    ///
    /// # Errors
    ///
    /// Returns a transient failure wrapping `ConcurrencyError::LockUnavailable`
    /// if the lock is still held when `wait` runs out, or the cache error if
    /// the store is unreachable.
    pub async fn acquire(
        store: &'a dyn KeyValueStore,
        machine_id: Uuid,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Self, ProcessingError> {
        let key = machine_lock_key(machine_id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            if store.set_if_absent(&key, &token, ttl).await? {
                debug!(%machine_id, "machine lock acquired");
                return Ok(Self { store, key, token });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConcurrencyError::LockUnavailable {
                    machine_id,
                    waited_secs: wait.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Release the lock if this holder still owns it.
    pub async fn release(self) {
        match self.store.delete_if_equals(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "machine lock released"),
            Ok(false) => warn!(key = %self.key, "machine lock expired before release"),
            Err(error) => warn!(key = %self.key, %error, "failed to release machine lock"),
        }
    }
}
