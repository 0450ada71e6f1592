//! Per-file state machine owned by the authority.
//!
//! Everything here is synchronous; the coordinator wraps each
//! [`TrackedFile`] in its own mutex and performs callbacks around it.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use serde::Serialize;
use shared_cache_core::{AuthorityState, CallbackOutcome, ClientCallbacks, ClientId, FileContents};

/// A client's current access to one file.
pub struct Registrant {
    /// Registered client.
    pub client: ClientId,
    /// Access held; `WriteShared`/`OwnershipChange` mark the owner.
    pub access: AuthorityState,
    /// Handle used for `invalidate` and `writeback`.
    pub callbacks: Arc<dyn ClientCallbacks>,
}

impl fmt::Debug for Registrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrant")
            .field("client", &self.client)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// Record of an ownership transfer in flight, needed to undo it.
#[derive(Clone)]
pub struct Transfer {
    /// Owner asked to write back.
    pub owner: ClientId,
    /// The owner's callback handle.
    pub callbacks: Arc<dyn ClientCallbacks>,
    prior_state: AuthorityState,
}

/// Point-in-time copy of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    /// File name as requested by clients.
    pub name: String,
    /// Aggregate sharing state.
    pub state: AuthorityState,
    /// Authoritative copy held by the authority.
    pub contents: FileContents,
    /// Access held by each registered client.
    pub registrants: BTreeMap<ClientId, AuthorityState>,
}

impl FileSnapshot {
    /// The write owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&ClientId> {
        self.registrants
            .iter()
            .find(|(_, access)| access.holds_write())
            .map(|(client, _)| client)
    }
}

/// A file some client has requested.
#[derive(Debug)]
pub struct TrackedFile {
    name: String,
    contents: FileContents,
    state: AuthorityState,
    registrants: HashMap<ClientId, Registrant>,
}

impl TrackedFile {
    /// Start tracking a file with its stored contents.
    #[must_use]
    pub fn new(name: impl Into<String>, contents: FileContents) -> Self {
        Self {
            name: name.into(),
            contents,
            state: AuthorityState::NotShared,
            registrants: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn contents(&self) -> &FileContents {
        &self.contents
    }

    #[must_use]
    pub const fn state(&self) -> AuthorityState {
        self.state
    }

    /// The registrant holding write access, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&Registrant> {
        self.registrants.values().find(|r| r.access.holds_write())
    }

    /// Access currently held by `client`.
    #[must_use]
    pub fn access_of(&self, client: &ClientId) -> Option<AuthorityState> {
        self.registrants.get(client).map(|r| r.access)
    }

    fn register(
        &mut self,
        client: &ClientId,
        access: AuthorityState,
        callbacks: Arc<dyn ClientCallbacks>,
    ) {
        tracing::debug!(file = %self.name, client = %client, ?access, "Registering client");
        self.registrants.insert(
            client.clone(),
            Registrant {
                client: client.clone(),
                access,
                callbacks,
            },
        );
    }

    /// Register `client` as a reader.
    ///
    /// A client that already owns the file keeps its write access; only the
    /// callback handle is refreshed.
    pub fn register_reader(&mut self, client: &ClientId, callbacks: Arc<dyn ClientCallbacks>) {
        if self.state == AuthorityState::NotShared {
            self.state = AuthorityState::ReadShared;
        }
        let access = match self.access_of(client) {
            Some(access) if access.holds_write() => access,
            _ => AuthorityState::ReadShared,
        };
        self.register(client, access, callbacks);
    }

    /// Make `client` the write owner. The caller must have checked that no
    /// other owner exists.
    pub fn register_owner(&mut self, client: &ClientId, callbacks: Arc<dyn ClientCallbacks>) {
        debug_assert!(self.owner().is_none_or(|o| o.client == *client));
        self.state = AuthorityState::WriteShared;
        self.register(client, AuthorityState::WriteShared, callbacks);
    }

    /// Mark the current owner as being asked to write back.
    ///
    /// Returns `None` when there is no owner.
    pub fn begin_transfer(&mut self) -> Option<Transfer> {
        let prior_state = self.state;
        let owner = self.registrants.values_mut().find(|r| r.access.holds_write())?;
        owner.access = AuthorityState::OwnershipChange;
        let transfer = Transfer {
            owner: owner.client.clone(),
            callbacks: Arc::clone(&owner.callbacks),
            prior_state,
        };
        self.state = AuthorityState::OwnershipChange;
        Some(transfer)
    }

    /// Undo [`begin_transfer`](Self::begin_transfer).
    ///
    /// If the old owner is still mid-transfer, its access and the file state
    /// go back to what they were. If it has meanwhile committed or been
    /// de-registered, whatever that left behind stands.
    pub fn abort_transfer(&mut self, transfer: &Transfer) {
        let Some(owner) = self.registrants.get_mut(&transfer.owner) else {
            return;
        };
        if owner.access == AuthorityState::OwnershipChange {
            owner.access = AuthorityState::WriteShared;
            self.state = transfer.prior_state;
        }
    }

    /// Callback handles of every registrant except `committer`.
    #[must_use]
    pub fn invalidation_targets(
        &self,
        committer: &ClientId,
    ) -> Vec<(ClientId, Arc<dyn ClientCallbacks>)> {
        self.registrants
            .values()
            .filter(|r| r.client != *committer)
            .map(|r| (r.client.clone(), Arc::clone(&r.callbacks)))
            .collect()
    }

    /// Apply a persisted commit.
    ///
    /// Every invalidated registrant is dropped; those whose callback failed
    /// are returned as degraded. The committer gives up ownership: it is
    /// dropped, unless it was flushing for a transfer, in which case it keeps
    /// its copy as a reader.
    pub fn finish_commit(
        &mut self,
        committer: &ClientId,
        contents: FileContents,
        outcomes: &[(ClientId, CallbackOutcome)],
    ) -> Vec<ClientId> {
        self.contents = contents;

        let mut degraded = Vec::new();
        for (client, outcome) in outcomes {
            let Some(registrant) = self.registrants.get_mut(client) else {
                continue;
            };
            if !outcome.is_success() {
                tracing::warn!(
                    file = %self.name,
                    client = %client,
                    %outcome,
                    "Invalidation failed, forcing client to not_shared"
                );
                degraded.push(client.clone());
            }
            registrant.access = AuthorityState::NotShared;
        }

        if let Some(registrant) = self.registrants.get_mut(committer) {
            registrant.access = if registrant.access == AuthorityState::OwnershipChange {
                AuthorityState::ReadShared
            } else {
                AuthorityState::NotShared
            };
        }

        self.trim();
        self.state = if self.registrants.is_empty() {
            AuthorityState::NotShared
        } else {
            AuthorityState::ReadShared
        };
        degraded
    }

    /// Remove `client`. Returns whether it was registered.
    ///
    /// Removing the owner lapses ownership, so the state falls back to what
    /// the remaining registrants imply. Removing a reader leaves the state alone.
    pub fn deregister(&mut self, client: &ClientId) -> bool {
        let Some(removed) = self.registrants.remove(client) else {
            return false;
        };
        tracing::debug!(file = %self.name, client = %client, "Deregistered client");
        if removed.access.holds_write() {
            self.state = if self.registrants.is_empty() {
                AuthorityState::NotShared
            } else {
                AuthorityState::ReadShared
            };
        }
        true
    }

    fn trim(&mut self) {
        self.registrants
            .retain(|_, r| r.access != AuthorityState::NotShared);
    }

    /// Copy out the observable state.
    #[must_use]
    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            name: self.name.clone(),
            state: self.state,
            contents: self.contents.clone(),
            registrants: self
                .registrants
                .values()
                .map(|r| (r.client.clone(), r.access))
                .collect(),
        }
    }
}
