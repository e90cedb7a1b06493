//! Template artifacts: object-store access and scoped build workspaces.
//!
//! A template is stored as a zip archive named `{template_id}.zip` in a single
//! bucket. The orchestrator fetches it through an [`ArtifactStore`], unpacks it
//! into a [`TemplateWorkspace`] that lives only for the duration of one create
//! operation, and hands the resulting tar build context to the engine.

mod s3;
mod workspace;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use futures_util::future;

use crate::error::ArtifactError;

pub use s3::S3ArtifactStore;
pub use workspace::TemplateWorkspace;

/// Boxed future returned by [`ArtifactStore`] implementors.
pub type ArtifactFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ArtifactError>> + Send + 'a>>;

/// Read access to packaged template artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Download the artifact stored under `key`.
    fn fetch<'a>(&'a self, key: &'a str) -> ArtifactFuture<'a, Vec<u8>>;
}

/// Artifact store held in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an artifact under `key`.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::WorkspaceFailed` if the object map lock is
    /// poisoned.
    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) -> Result<(), ArtifactError> {
        self.objects
            .lock()
            .map_err(|_| ArtifactError::WorkspaceFailed {
                message: String::from("artifact store lock poisoned"),
            })?
            .insert(key.into(), bytes);
        Ok(())
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn fetch<'a>(&'a self, key: &'a str) -> ArtifactFuture<'a, Vec<u8>> {
        let result = self
            .objects
            .lock()
            .map_err(|_| ArtifactError::WorkspaceFailed {
                message: String::from("artifact store lock poisoned"),
            })
            .and_then(|objects| {
                objects
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ArtifactError::NotFound {
                        bucket: String::from("memory"),
                        key: key.to_owned(),
                    })
            });
        Box::pin(future::ready(result))
    }
}
