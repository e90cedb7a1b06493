//! Key-value storage for the template cache and coordination records.
//!
//! Besides caching template records, the key-value store carries the create
//! dedup ledger, the per-machine locks, and the transient-failure attempt
//! counters. All of these need expiring keys and atomic set-if-absent, which
//! [`KeyValueStore`] exposes. [`RedisKeyValue`] is used in deployments;
//! [`MemoryKeyValue`] serves single-process runs and tests.

mod memory;
mod redis_store;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::CacheError;

pub use memory::MemoryKeyValue;
pub use redis_store::RedisKeyValue;

/// Boxed future returned by [`KeyValueStore`] implementors.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Expiring string key-value operations.
pub trait KeyValueStore: Send + Sync {
    /// Read a key, returning `None` when absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Write a key with a time-to-live, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()>;

    /// Write a key only if it is absent. Returns whether the write happened.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool>;

    /// Increment a counter, refreshing its time-to-live. Returns the new value.
    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64>;

    /// Remove a key if present.
    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;

    /// Remove a key only if it currently holds `expected`. Returns whether the
    /// key was removed.
    fn delete_if_equals<'a>(&'a self, key: &'a str, expected: &'a str) -> CacheFuture<'a, bool>;
}

/// Cache key for a template record.
#[must_use]
pub fn template_key(template_id: uuid::Uuid) -> String {
    format!("template:{template_id}")
}

/// Ledger key recording the outcome of a create request.
#[must_use]
pub fn create_ledger_key(idempotency_key: &str) -> String {
    format!("ledger:create:{idempotency_key}")
}

/// Lock key serialising transitions of one machine.
#[must_use]
pub fn machine_lock_key(machine_id: uuid::Uuid) -> String {
    format!("lock:machine:{machine_id}")
}

/// Counter key tracking delivery attempts of one message.
#[must_use]
pub fn attempts_key(idempotency_key: &str) -> String {
    format!("attempts:{idempotency_key}")
}

/// Milliseconds in `ttl`, clamped to at least one.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
