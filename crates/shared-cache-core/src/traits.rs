//! Traits at the seams between the store, the authority and its clients.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    AccessMode, CallbackError, ClientId, CoherenceError, CommitReport, FileContents, StoreError,
};

/// Trait for durable whole-file storage backends.
///
/// Holds no coherence logic; the authority is its only writer.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read a file. Returns `Ok(None)` when nothing is stored under `name`.
    async fn read(&self, name: &str) -> Result<Option<FileContents>, StoreError>;

    /// Replace the whole file stored under `name`.
    async fn write(&self, name: &str, contents: &FileContents) -> Result<(), StoreError>;
}

/// Operations the authority exposes to clients.
#[async_trait]
pub trait AuthorityService: Send + Sync {
    /// Open `filename` for reading or writing and fetch its current contents.
    ///
    /// # Errors
    /// `NotFound` for unreadable or empty files, `OwnershipTransferFailed`
    /// when the current owner could not write back.
    async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError>;

    /// Submit new contents for a file the client owns.
    ///
    /// On error the client must assume the contents were NOT stored.
    ///
    /// # Errors
    /// `NotFound`, `NotOwned` or `StoreWriteFailed`.
    async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError>;
}

/// Operations each client exposes to the authority.
///
/// `Ok(false)` means the client refused the request in its current state.
#[async_trait]
pub trait ClientCallbacks: Send + Sync {
    /// Discard the cached read copy; another client changed the file.
    async fn invalidate(&self) -> Result<bool, CallbackError>;

    /// Write the owned copy back; another client wants ownership.
    async fn writeback(&self) -> Result<bool, CallbackError>;
}

#[async_trait]
impl<T: AuthorityService + ?Sized> AuthorityService for Arc<T> {
    async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError> {
        (**self).acquire(client, filename, mode).await
    }

    async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError> {
        (**self).commit(client, filename, contents).await
    }
}
