//! Filesystem content store.

use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use shared_cache_core::{ContentStore, FileContents, StoreError};

/// Store backed by files under a root directory.
///
/// Names are joined to the root verbatim; an absolute name escapes the
/// root, as the authority never normalizes client-supplied names.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn read(&self, name: &str) -> Result<Option<FileContents>, StoreError> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!(path = %path.display(), len = bytes.len(), "Read file");
                Ok(Some(FileContents::from(bytes)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write(&self, name: &str, contents: &FileContents) -> Result<(), StoreError> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents.as_bytes()).await?;
        tracing::debug!(path = %path.display(), len = contents.len(), "Wrote file");
        Ok(())
    }
}
