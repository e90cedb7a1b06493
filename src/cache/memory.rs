//! In-process key-value store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future;

use super::{CacheFuture, KeyValueStore};
use crate::error::CacheError;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Key-value store held in process memory.
///
/// Expired entries are treated as absent and dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKeyValue {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, command: &'static str) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::CommandFailed {
            command,
            message: String::from("cache lock poisoned"),
        })?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries)
    }

    fn read(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries("GET")?.get(key).map(|entry| entry.value.clone()))
    }

    fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries("SET")?
            .insert(key.to_owned(), Entry::new(value.to_owned(), ttl));
        Ok(())
    }

    fn write_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries("SET NX")?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), Entry::new(value.to_owned(), ttl));
        Ok(true)
    }

    fn bump(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let mut entries = self.entries("INCR")?;
        let current = entries
            .get(key)
            .map(|entry| entry.value.parse::<u64>())
            .transpose()
            .map_err(|error| CacheError::DecodeFailed {
                key: key.to_owned(),
                message: error.to_string(),
            })?
            .unwrap_or(0);
        let next = current.saturating_add(1);
        entries.insert(key.to_owned(), Entry::new(next.to_string(), ttl));
        Ok(next)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries("DEL")?.remove(key);
        Ok(())
    }

    fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries("EVALSHA")?;
        if entries.get(key).is_some_and(|entry| entry.value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

impl KeyValueStore for MemoryKeyValue {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(future::ready(self.read(key)))
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(future::ready(self.write(key, value, ttl)))
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool> {
        Box::pin(future::ready(self.write_if_absent(key, value, ttl)))
    }

    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64> {
        Box::pin(future::ready(self.bump(key, ttl)))
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(future::ready(self.remove(key)))
    }

    fn delete_if_equals<'a>(&'a self, key: &'a str, expected: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(future::ready(self.remove_if_equals(key, expected)))
    }
}
