//! Authority coordinator: one state machine per tracked file.
//!
//! Each tracked file lives behind its own mutex, so requests for different
//! files run independently while requests for the same file are serialized.
//!
//! Two callback policies keep the per-file lock from deadlocking against
//! the clients it calls:
//! - `writeback` is issued with the lock released, because the owner answers
//!   it by calling back into [`Coordinator::commit`] for the same file. The
//!   file and the owner sit in `OwnershipChange` meanwhile, and the owner is
//!   re-checked when the lock is re-taken.
//! - `invalidate` is issued with the lock held. Clients answer it locally,
//!   and every call is bounded by the configured callback timeout.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use shared_cache_core::{
    AccessMode, AuthorityConfig, AuthorityService, AuthorityState, CallbackError, CallbackOutcome,
    ClientCallbacks, ClientId, CoherenceError, CommitReport, ContentStore, FileContents,
};
use shared_cache_store::FsStore;
use tokio::sync::{Mutex, RwLock};

use crate::{
    ClientDirectory,
    tracked::{FileSnapshot, TrackedFile},
};

type FileSlot = Arc<Mutex<TrackedFile>>;

/// Authority coordinator.
pub struct Coordinator<S>
where
    S: ContentStore,
{
    store: S,
    directory: ClientDirectory,
    config: AuthorityConfig,
    files: RwLock<HashMap<String, FileSlot>>,
}

impl<S> Coordinator<S>
where
    S: ContentStore,
{
    /// Create a coordinator over `store`, calling back clients found in `directory`.
    #[must_use]
    pub fn new(store: S, directory: ClientDirectory, config: AuthorityConfig) -> Self {
        Self {
            store,
            directory,
            config,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Directory of connected clients.
    #[must_use]
    pub const fn directory(&self) -> &ClientDirectory {
        &self.directory
    }

    /// Underlying content store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Names of every file tracked so far.
    pub async fn tracked_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current state of a tracked file.
    pub async fn snapshot(&self, filename: &str) -> Option<FileSnapshot> {
        let slot = self.lookup(filename).await?;
        let file = slot.lock().await;
        Some(file.snapshot())
    }

    /// Remove `client` from a file's registrants. Unknown files and clients
    /// are ignored.
    pub async fn deregister(&self, client: &ClientId, filename: &str) {
        if let Some(slot) = self.lookup(filename).await {
            slot.lock().await.deregister(client);
        }
    }

    /// Open a file for `client`.
    ///
    /// # Errors
    /// - `UnknownClient` if the client has no callback handle in the directory
    /// - `NotFound` if the file is missing, unreadable or empty
    /// - `OwnershipTransferFailed` if a write request could not take
    ///   ownership from the current owner
    pub async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError> {
        let callbacks = self
            .directory
            .get(client)
            .ok_or_else(|| CoherenceError::UnknownClient(client.clone()))?;

        // A client holds at most one file at a time.
        self.sweep(client, filename).await;

        let slot = self.resolve(filename).await?;
        match mode {
            AccessMode::Read => {
                let mut file = slot.lock().await;
                file.register_reader(client, callbacks);
                tracing::debug!(file = %filename, client = %client, "Granted read access");
                Ok(file.contents().clone())
            }
            AccessMode::Write => self.acquire_write(&slot, client, callbacks).await,
        }
    }

    async fn acquire_write(
        &self,
        slot: &FileSlot,
        client: &ClientId,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Result<FileContents, CoherenceError> {
        let mut file = slot.lock().await;
        let filename = file.name().to_string();

        let owner = file.owner().map(|o| (o.client.clone(), o.access));
        let transfer = match owner {
            None => {
                file.register_owner(client, callbacks);
                tracing::info!(file = %filename, client = %client, "Granted ownership");
                return Ok(file.contents().clone());
            }
            Some((owner, _)) if owner == *client => return Ok(file.contents().clone()),
            Some((owner, AuthorityState::OwnershipChange)) => {
                tracing::warn!(
                    file = %filename,
                    client = %client,
                    owner = %owner,
                    "Ownership transfer already in flight"
                );
                return Err(CoherenceError::OwnershipTransferFailed {
                    filename,
                    owner,
                    outcome: CallbackOutcome::Failure,
                });
            }
            Some(_) => file
                .begin_transfer()
                .ok_or_else(|| CoherenceError::NotFound(filename.clone()))?,
        };
        drop(file);

        tracing::info!(
            file = %filename,
            client = %client,
            owner = %transfer.owner,
            "Requesting writeback"
        );
        let owner_callbacks = self.callbacks_for(&transfer.owner, &transfer.callbacks);
        let outcome = self
            .invoke(&transfer.owner, "writeback", owner_callbacks.writeback())
            .await;

        // Whatever the callback reported, the transfer completes only if the
        // owner released ownership meanwhile. A commit of its own that raced
        // the writeback releases it just as well.
        let mut file = slot.lock().await;
        if let Some(owner) = file.owner() {
            let owner = owner.client.clone();
            file.abort_transfer(&transfer);
            let outcome = if outcome.is_success() {
                tracing::warn!(
                    file = %filename,
                    owner = %owner,
                    "Writeback accepted but ownership not released"
                );
                CallbackOutcome::Failure
            } else {
                tracing::warn!(
                    file = %filename,
                    owner = %owner,
                    %outcome,
                    "Writeback failed, ownership retained"
                );
                outcome
            };
            return Err(CoherenceError::OwnershipTransferFailed {
                filename,
                owner,
                outcome,
            });
        }
        if !outcome.is_success() {
            tracing::debug!(
                file = %filename,
                owner = %transfer.owner,
                %outcome,
                "Writeback failed but ownership was already released"
            );
        }

        file.register_owner(client, callbacks);
        tracing::info!(
            file = %filename,
            client = %client,
            previous = %transfer.owner,
            "Ownership transferred"
        );
        Ok(file.contents().clone())
    }

    /// Store new contents for a file owned by `client`.
    ///
    /// # Errors
    /// - `NotFound` if the file is not tracked
    /// - `NotOwned` if `client` is not the write owner
    /// - `StoreWriteFailed` if the store rejects the write; nothing changes
    pub async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError> {
        let slot = self
            .lookup(filename)
            .await
            .ok_or_else(|| CoherenceError::NotFound(filename.to_string()))?;
        let mut file = slot.lock().await;

        if file.owner().is_none_or(|owner| owner.client != *client) {
            tracing::warn!(file = %filename, client = %client, "Commit refused: not the owner");
            return Err(CoherenceError::NotOwned {
                filename: filename.to_string(),
                client: client.clone(),
            });
        }

        if let Err(source) = self.store.write(filename, &contents).await {
            tracing::error!(file = %filename, client = %client, "Store write failed: {source}");
            return Err(CoherenceError::StoreWriteFailed {
                filename: filename.to_string(),
                source,
            });
        }

        let targets = file.invalidation_targets(client);
        let outcomes = join_all(targets.into_iter().map(|(target, stored)| async move {
            let callbacks = self.callbacks_for(&target, &stored);
            let outcome = self
                .invoke(&target, "invalidate", callbacks.invalidate())
                .await;
            (target, outcome)
        }))
        .await;

        let degraded = file.finish_commit(client, contents, &outcomes);
        tracing::info!(
            file = %filename,
            client = %client,
            invalidated = outcomes.len(),
            degraded = degraded.len(),
            "Committed"
        );
        Ok(CommitReport {
            filename: filename.to_string(),
            degraded,
        })
    }

    /// The client's current handle, falling back to the one it registered with.
    fn callbacks_for(
        &self,
        client: &ClientId,
        stored: &Arc<dyn ClientCallbacks>,
    ) -> Arc<dyn ClientCallbacks> {
        self.directory
            .get(client)
            .unwrap_or_else(|| Arc::clone(stored))
    }

    /// Run a callback under the configured timeout.
    async fn invoke<F>(&self, client: &ClientId, kind: &'static str, call: F) -> CallbackOutcome
    where
        F: Future<Output = Result<bool, CallbackError>> + Send,
    {
        match tokio::time::timeout(self.config.callback_timeout, call).await {
            Ok(Ok(true)) => CallbackOutcome::Success,
            Ok(Ok(false)) => {
                tracing::debug!(client = %client, kind, "Callback refused");
                CallbackOutcome::Failure
            }
            Ok(Err(e)) => {
                tracing::warn!(client = %client, kind, "Callback failed: {e}");
                CallbackOutcome::Failure
            }
            Err(_) => {
                tracing::warn!(
                    client = %client,
                    kind,
                    timeout = ?self.config.callback_timeout,
                    "Callback timed out"
                );
                CallbackOutcome::Timeout
            }
        }
    }

    async fn lookup(&self, filename: &str) -> Option<FileSlot> {
        self.files.read().await.get(filename).cloned()
    }

    /// Find a tracked file, loading it from the store on first use.
    ///
    /// Missing, unreadable and empty files are never cached.
    async fn resolve(&self, filename: &str) -> Result<FileSlot, CoherenceError> {
        if filename.is_empty() {
            return Err(CoherenceError::NotFound(String::new()));
        }
        if let Some(slot) = self.lookup(filename).await {
            return Ok(slot);
        }

        let contents = match self.store.read(filename).await {
            Ok(Some(contents)) if !contents.is_empty() => contents,
            Ok(_) => return Err(CoherenceError::NotFound(filename.to_string())),
            Err(e) => {
                tracing::warn!(file = %filename, "Unable to read file: {e}");
                return Err(CoherenceError::NotFound(filename.to_string()));
            }
        };

        let mut files = self.files.write().await;
        let slot = files.entry(filename.to_string()).or_insert_with(|| {
            tracing::debug!(file = %filename, len = contents.len(), "Tracking file");
            Arc::new(Mutex::new(TrackedFile::new(filename, contents)))
        });
        Ok(Arc::clone(slot))
    }

    /// De-register `client` from every tracked file except `keep`.
    async fn sweep(&self, client: &ClientId, keep: &str) {
        let slots: Vec<FileSlot> = self
            .files
            .read()
            .await
            .iter()
            .filter(|(name, _)| name.as_str() != keep)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();

        for slot in slots {
            slot.lock().await.deregister(client);
        }
    }
}

impl Coordinator<FsStore> {
    /// Coordinator over the filesystem store rooted at `config.store_root`.
    #[must_use]
    pub fn from_config(directory: ClientDirectory, config: AuthorityConfig) -> Self {
        Self::new(FsStore::new(&config.store_root), directory, config)
    }
}

#[async_trait]
impl<S> AuthorityService for Coordinator<S>
where
    S: ContentStore,
{
    async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError> {
        Self::acquire(self, client, filename, mode).await
    }

    async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError> {
        Self::commit(self, client, filename, contents).await
    }
}
