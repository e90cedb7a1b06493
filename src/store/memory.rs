//! In-process repositories.
//!
//! Used by tests and by local runs without a database. Records live in a
//! mutex-guarded map; every operation completes immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures_util::future;
use uuid::Uuid;

use super::{MachineRepository, StoreFuture, TemplateRepository};
use crate::error::StoreError;
use crate::model::{Machine, Template};

/// In-memory machine and template store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<Uuid, Machine>>,
    templates: Mutex<HashMap<Uuid, Template>>,
    deletions: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template record, replacing any with the same identifier.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::QueryFailed` if the template map lock is poisoned.
    pub fn put_template(&self, template: Template) -> Result<(), StoreError> {
        lock(&self.templates, "put template")?.insert(template.id, template);
        Ok(())
    }

    /// Snapshot every stored machine.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::QueryFailed` if the machine map lock is poisoned.
    pub fn machines(&self) -> Result<Vec<Machine>, StoreError> {
        Ok(lock(&self.machines, "list machines")?
            .values()
            .cloned()
            .collect())
    }

    /// Number of delete calls that actually removed a record.
    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.deletions.load(Ordering::SeqCst)
    }

    fn find(&self, id: Uuid) -> Result<Option<Machine>, StoreError> {
        Ok(lock(&self.machines, "find machine")?.get(&id).cloned())
    }

    fn insert(&self, machine: &Machine) -> Result<(), StoreError> {
        let mut machines = lock(&self.machines, "insert machine")?;
        if machines.contains_key(&machine.id) {
            return Err(StoreError::QueryFailed {
                operation: "insert machine",
                message: format!("duplicate key {}", machine.id),
            });
        }
        machines.insert(machine.id, machine.clone());
        Ok(())
    }

    fn update(&self, machine: &Machine) -> Result<bool, StoreError> {
        let mut machines = lock(&self.machines, "update machine")?;
        let Some(stored) = machines.get_mut(&machine.id) else {
            return Ok(false);
        };
        stored.clone_from(machine);
        Ok(true)
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = lock(&self.machines, "delete machine")?.remove(&id).is_some();
        if removed {
            self.deletions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}

fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    operation: &'static str,
) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::QueryFailed {
        operation,
        message: String::from("store lock poisoned"),
    })
}

impl MachineRepository for MemoryStore {
    fn find_machine(&self, id: Uuid) -> StoreFuture<'_, Option<Machine>> {
        Box::pin(future::ready(self.find(id)))
    }

    fn insert_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, ()> {
        Box::pin(future::ready(self.insert(machine)))
    }

    fn update_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, bool> {
        Box::pin(future::ready(self.update(machine)))
    }

    fn delete_machine(&self, id: Uuid) -> StoreFuture<'_, bool> {
        Box::pin(future::ready(self.delete(id)))
    }
}

impl TemplateRepository for MemoryStore {
    fn find_template(&self, id: Uuid) -> StoreFuture<'_, Option<Template>> {
        let result = lock(&self.templates, "find template").map(|templates| templates.get(&id).cloned());
        Box::pin(future::ready(result))
    }
}
