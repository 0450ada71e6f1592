//! Client cache agent.
//!
//! The agent caches one file at a time. Its state sits behind a plain mutex
//! that is never held across an `.await`, so inbound callbacks from the
//! authority are never blocked by an outbound call in flight.
//!
//! Flushes (voluntary commits and writebacks) are serialized by a separate
//! async mutex, so each one sees the state the previous one left behind.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use shared_cache_core::{
    AccessMode, AuthorityService, CallbackError, ClientCacheState, ClientCallbacks, ClientId,
    CoherenceError, CommitReport, FileContents,
};

/// Agent error.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Authority(#[from] CoherenceError),
    #[error("Nothing to commit in state {0:?}")]
    NothingToCommit(ClientCacheState),
    #[error("Cached copy is not writable in state {0:?}")]
    NotWritable(ClientCacheState),
}

#[derive(Debug, Default)]
struct Cache {
    filename: Option<String>,
    state: ClientCacheState,
    contents: Option<FileContents>,
    /// Set while a read acquire is in flight; records whether an
    /// invalidation arrived before its reply.
    pending_read: Option<bool>,
}

impl Cache {
    fn usable(&self, filename: &str, mode: AccessMode) -> bool {
        if self.filename.as_deref() != Some(filename) {
            return false;
        }
        match (mode, self.state) {
            (_, ClientCacheState::ReleasePending) => false,
            (AccessMode::Read, state) => state != ClientCacheState::Invalid,
            (AccessMode::Write, state) => state == ClientCacheState::WriteOwned,
        }
    }

    const fn holds_write(&self) -> bool {
        matches!(
            self.state,
            ClientCacheState::WriteOwned | ClientCacheState::ReleasePending
        )
    }
}

/// Client cache agent.
pub struct ClientCacheAgent<A>
where
    A: AuthorityService,
{
    client: ClientId,
    authority: A,
    cache: Mutex<Cache>,
    flush: tokio::sync::Mutex<()>,
}

impl<A> ClientCacheAgent<A>
where
    A: AuthorityService,
{
    /// Create an agent with an empty cache.
    #[must_use]
    pub fn new(client: ClientId, authority: A) -> Self {
        Self {
            client,
            authority,
            cache: Mutex::new(Cache::default()),
            flush: tokio::sync::Mutex::new(()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This agent's client identifier.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client
    }

    /// Current cache state.
    #[must_use]
    pub fn state(&self) -> ClientCacheState {
        self.cache().state
    }

    /// Name of the cached file, if any.
    #[must_use]
    pub fn current_file(&self) -> Option<String> {
        self.cache().filename.clone()
    }

    /// Cached bytes, if any. May be stale when the state is `Invalid`.
    #[must_use]
    pub fn contents(&self) -> Option<FileContents> {
        self.cache().contents.clone()
    }

    /// True if the cached copy can be used for `mode` without asking the authority.
    #[must_use]
    pub fn has_usable_copy(&self, filename: &str, mode: AccessMode) -> bool {
        self.cache().usable(filename, mode)
    }

    /// Return a usable copy of `filename`, acquiring it from the authority
    /// if the cache cannot serve it.
    ///
    /// Switching away from a file this client still owns commits it first.
    ///
    /// # Errors
    /// Returns the authority's error when the flush or the acquire fails; the
    /// cache is left as it was.
    pub async fn acquire_if_needed(
        &self,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, AgentError> {
        let holds_write = {
            let cache = self.cache();
            if cache.usable(filename, mode) {
                if let Some(contents) = &cache.contents {
                    return Ok(contents.clone());
                }
            }
            cache.holds_write()
        };

        if holds_write {
            tracing::debug!(client = %self.client, "Flushing owned file before acquire");
            let _flush = self.flush.lock().await;
            match self.flush_held().await {
                // A writeback flushed it while we waited.
                Ok(_) | Err(AgentError::NothingToCommit(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if mode == AccessMode::Read {
            self.cache().pending_read = Some(false);
        }
        let result = self.authority.acquire(&self.client, filename, mode).await;

        let mut cache = self.cache();
        let invalidated = cache.pending_read.take().unwrap_or(false);
        let contents = result?;

        cache.state = match mode {
            AccessMode::Read if invalidated => ClientCacheState::Invalid,
            AccessMode::Read => match cache.state {
                ClientCacheState::Invalid => ClientCacheState::ReadShared,
                state => state,
            },
            AccessMode::Write => ClientCacheState::WriteOwned,
        };
        cache.filename = Some(filename.to_string());
        cache.contents = Some(contents.clone());
        tracing::debug!(
            client = %self.client,
            file = %filename,
            state = ?cache.state,
            "Acquired"
        );
        Ok(contents)
    }

    /// Replace the cached bytes of the owned file.
    ///
    /// # Errors
    /// `NotWritable` unless the cache is `WriteOwned`.
    pub fn update_contents(&self, contents: impl Into<FileContents>) -> Result<(), AgentError> {
        let mut cache = self.cache();
        if cache.state != ClientCacheState::WriteOwned {
            return Err(AgentError::NotWritable(cache.state));
        }
        cache.contents = Some(contents.into());
        Ok(())
    }

    /// Send the cached bytes to the authority.
    ///
    /// # Errors
    /// `NothingToCommit` unless the client owns its file; otherwise the
    /// authority's error, in which case the cache is unchanged and the bytes
    /// must not be assumed stored.
    pub async fn commit_local(&self) -> Result<CommitReport, AgentError> {
        let _flush = self.flush.lock().await;
        self.flush_held().await
    }

    /// Commit the owned copy. The caller holds `self.flush`.
    async fn flush_held(&self) -> Result<CommitReport, AgentError> {
        let (filename, contents) = {
            let cache = self.cache();
            match (&cache.filename, &cache.contents) {
                (Some(filename), Some(contents)) if cache.holds_write() => {
                    (filename.clone(), contents.clone())
                }
                _ => return Err(AgentError::NothingToCommit(cache.state)),
            }
        };

        let report = self
            .authority
            .commit(&self.client, &filename, contents)
            .await?;

        let mut cache = self.cache();
        cache.state = match cache.state {
            ClientCacheState::WriteOwned => ClientCacheState::Invalid,
            ClientCacheState::ReleasePending => ClientCacheState::ReadShared,
            state => state,
        };
        tracing::debug!(
            client = %self.client,
            file = %filename,
            state = ?cache.state,
            "Committed"
        );
        Ok(report)
    }
}

#[async_trait]
impl<A> ClientCallbacks for ClientCacheAgent<A>
where
    A: AuthorityService,
{
    async fn invalidate(&self) -> Result<bool, CallbackError> {
        let mut cache = self.cache();
        if cache.state == ClientCacheState::ReadShared {
            cache.state = ClientCacheState::Invalid;
            tracing::debug!(client = %self.client, "Cached copy invalidated");
            return Ok(true);
        }
        if let Some(invalidated) = cache.pending_read.as_mut() {
            *invalidated = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn writeback(&self) -> Result<bool, CallbackError> {
        let _flush = self.flush.lock().await;
        {
            let mut cache = self.cache();
            if cache.state != ClientCacheState::WriteOwned {
                return Ok(false);
            }
            cache.state = ClientCacheState::ReleasePending;
        }

        match self.flush_held().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(client = %self.client, "Writeback flush failed: {e}");
                Ok(false)
            }
        }
    }
}
