//! Relational storage for machine and template records.
//!
//! Handlers depend on the [`MachineRepository`] and [`TemplateRepository`]
//! traits rather than on a database driver. [`PgStore`] implements both over a
//! Postgres pool; [`memory::MemoryStore`] implements them in-process for tests
//! and local runs.

pub mod memory;
mod postgres;

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Machine, Template};

pub use postgres::PgStore;

/// Boxed future returned by repository implementors.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistence operations on machine records.
pub trait MachineRepository: Send + Sync {
    /// Look up a machine by identifier.
    fn find_machine(&self, id: Uuid) -> StoreFuture<'_, Option<Machine>>;

    /// Persist a new machine record.
    fn insert_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, ()>;

    /// Overwrite the mutable fields of an existing machine record.
    ///
    /// Returns `false` when no record with the machine's identifier exists.
    fn update_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, bool>;

    /// Delete a machine record.
    ///
    /// Returns `true` when this call removed the record and `false` when it
    /// was already absent.
    fn delete_machine(&self, id: Uuid) -> StoreFuture<'_, bool>;
}

/// Read access to template records.
pub trait TemplateRepository: Send + Sync {
    /// Look up a template by identifier.
    fn find_template(&self, id: Uuid) -> StoreFuture<'_, Option<Template>>;
}
