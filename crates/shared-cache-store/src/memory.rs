//! In-memory content store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use shared_cache_core::{ContentStore, FileContents, StoreError};

/// In-memory store implementation.
///
/// Useful for tests and single-process deployments.
/// Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<String, FileContents>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with files.
    #[must_use]
    pub fn with_files<N, C>(files: impl IntoIterator<Item = (N, C)>) -> Self
    where
        N: Into<String>,
        C: Into<FileContents>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(name, contents)| (name.into(), contents.into()))
                    .collect(),
            ),
        }
    }

    /// Put a file directly into the store, bypassing any authority.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn seed(
        &self,
        name: impl Into<String>,
        contents: impl Into<FileContents>,
    ) -> Result<(), StoreError> {
        self.files
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(name.into(), contents.into());
        Ok(())
    }

    /// Snapshot of what is currently stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<FileContents> {
        self.files.read().ok()?.get(name).cloned()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn read(&self, name: &str) -> Result<Option<FileContents>, StoreError> {
        Ok(self
            .files
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(name)
            .cloned())
    }

    async fn write(&self, name: &str, contents: &FileContents) -> Result<(), StoreError> {
        self.files
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(name.to_string(), contents.clone());
        Ok(())
    }
}
