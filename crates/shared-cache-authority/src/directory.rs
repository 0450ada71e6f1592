//! Lookup of client callback handles by client identifier.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use shared_cache_core::{ClientCallbacks, ClientId};

/// Callback handles of every client currently known to the authority.
///
/// Transports register a client when its connection is established and
/// unregister it when the connection goes away. Clones share the same table.
#[derive(Clone, Default)]
pub struct ClientDirectory {
    clients: Arc<RwLock<HashMap<ClientId, Arc<dyn ClientCallbacks>>>>,
}

impl ClientDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the callback handle for `client`.
    pub fn register(&self, client: ClientId, callbacks: Arc<dyn ClientCallbacks>) {
        tracing::debug!(client = %client, "Client registered");
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(client, callbacks);
        }
    }

    /// Forget `client` only if `callbacks` is still its registered handle.
    ///
    /// Lets a closing connection clean up without removing the handle of a
    /// newer connection for the same client.
    pub fn unregister_handle(&self, client: &ClientId, callbacks: &Arc<dyn ClientCallbacks>) {
        if let Ok(mut clients) = self.clients.write() {
            let current = clients
                .get(client)
                .is_some_and(|h| std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(callbacks)));
            if current {
                clients.remove(client);
                tracing::debug!(client = %client, "Client unregistered");
            }
        }
    }

    /// Callback handle for `client`, if registered.
    #[must_use]
    pub fn get(&self, client: &ClientId) -> Option<Arc<dyn ClientCallbacks>> {
        self.clients.read().ok()?.get(client).cloned()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    /// True if no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
