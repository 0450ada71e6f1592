//! WebSocket client for a remote authority.
//!
//! [`RemoteAuthority`] implements [`AuthorityService`] over a WebSocket
//! connection and dispatches the authority's callbacks to a bound
//! [`ClientCallbacks`] handler, normally a
//! [`ClientCacheAgent`](shared_cache_agent::ClientCacheAgent).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared_cache_agent::ClientCacheAgent;
use shared_cache_core::{
    AccessMode, AuthorityService, ClientCallbacks, ClientId, CoherenceError, CommitReport,
    FileContents,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ServerMessage>>>>;
type Handler = Arc<OnceLock<Weak<dyn ClientCallbacks>>>;

/// Error establishing a connection to the authority.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed before registration")]
    ConnectionClosed,
    #[error("Registration rejected: {0}")]
    Rejected(String),
}

/// An authority reached over WebSocket.
pub struct RemoteAuthority {
    client: ClientId,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    pending: Pending,
    handler: Handler,
    tasks: [JoinHandle<()>; 2],
}

impl RemoteAuthority {
    /// Connect to `url` (e.g. `ws://127.0.0.1:7878/ws`) and register as `client`.
    ///
    /// # Errors
    /// Returns an error if the connection fails or the authority does not
    /// acknowledge the registration.
    pub async fn connect(url: &str, client: ClientId) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut writer, mut reader) = ws_stream.split();

        let (outbox, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {e}");
                        continue;
                    }
                };
                if writer.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        });

        let _ = outbox.send(ClientMessage::Register {
            client_id: client.clone(),
        });

        // The first reply settles the registration.
        let registration = loop {
            match next_message(&mut reader).await {
                Some(ServerMessage::Registered { .. }) => break Ok(()),
                Some(ServerMessage::Error { message }) => {
                    break Err(TransportError::Rejected(message));
                }
                Some(ServerMessage::Pong) => {}
                Some(other) => {
                    tracing::debug!("Ignoring {other:?} before registration");
                }
                None => break Err(TransportError::ConnectionClosed),
            }
        };
        if let Err(e) = registration {
            writer_task.abort();
            return Err(e);
        }

        let pending: Pending = Arc::default();
        let handler: Handler = Arc::default();
        let reader_task = tokio::spawn(dispatch(
            reader,
            outbox.clone(),
            Arc::clone(&pending),
            Arc::clone(&handler),
        ));
        tracing::info!(client = %client, url, "Connected to authority");

        Ok(Self {
            client,
            outbox,
            pending,
            handler,
            tasks: [writer_task, reader_task],
        })
    }

    /// Client identifier this connection registered as.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client
    }

    /// Route the authority's callbacks to `handler`.
    ///
    /// Only the first binding takes effect; returns false if one existed.
    /// Callbacks arriving while unbound, or after the handler is dropped,
    /// are refused.
    pub fn bind(&self, handler: Weak<dyn ClientCallbacks>) -> bool {
        self.handler.set(handler).is_ok()
    }

    async fn request(
        &self,
        make: impl FnOnce(Uuid) -> ClientMessage + Send,
    ) -> Result<ServerMessage, CoherenceError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, tx);

        if self.outbox.send(make(request_id)).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(CoherenceError::Transport("connection closed".to_string()));
        }
        rx.await
            .map_err(|_| CoherenceError::Transport("connection closed".to_string()))
    }
}

impl Drop for RemoteAuthority {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl AuthorityService for RemoteAuthority {
    async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError> {
        debug_assert_eq!(client, &self.client);
        let reply = self
            .request(|request_id| ClientMessage::Acquire {
                request_id,
                filename: filename.to_string(),
                mode: mode.as_token().to_string(),
            })
            .await?;

        match reply {
            ServerMessage::Failed { error, .. } => Err(error.into()),
            reply => reply
                .decode_acquired()
                .ok_or_else(|| CoherenceError::Transport(format!("Unexpected reply: {reply:?}"))),
        }
    }

    async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError> {
        debug_assert_eq!(client, &self.client);
        let reply = self
            .request(|request_id| ClientMessage::commit(request_id, filename, &contents))
            .await?;

        match reply {
            ServerMessage::Committed { degraded, .. } => Ok(CommitReport {
                filename: filename.to_string(),
                degraded,
            }),
            ServerMessage::Failed { error, .. } => Err(error.into()),
            reply => Err(CoherenceError::Transport(format!(
                "Unexpected reply: {reply:?}"
            ))),
        }
    }
}

/// Connect a cache agent to the authority at `url`.
///
/// The agent's callbacks are bound to the connection, so the authority can
/// invalidate it and request writebacks.
///
/// # Errors
/// Returns an error if the connection or registration fails.
pub async fn connect_agent(
    url: &str,
    client: ClientId,
) -> Result<Arc<ClientCacheAgent<Arc<RemoteAuthority>>>, TransportError> {
    let remote = Arc::new(RemoteAuthority::connect(url, client.clone()).await?);
    let agent = Arc::new(ClientCacheAgent::new(client, Arc::clone(&remote)));
    let handler = Arc::downgrade(&agent);
    remote.bind(handler);
    Ok(agent)
}

/// Reader loop: match replies to requests and answer callbacks.
async fn dispatch<R>(
    mut reader: R,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    pending: Pending,
    handler: Handler,
) where
    R: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = next_message(&mut reader).await {
        if let Some(request_id) = msg.reply_to() {
            match lock(&pending).remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => tracing::debug!(%request_id, "Reply to unknown request"),
            }
            continue;
        }

        match msg {
            ServerMessage::Invalidate { request_id } | ServerMessage::Writeback { request_id } => {
                let writeback = matches!(msg, ServerMessage::Writeback { .. });
                let callbacks = handler.get().and_then(Weak::upgrade);
                let outbox = outbox.clone();
                // A writeback commits through this connection, so it must not
                // block the reader.
                tokio::spawn(async move {
                    let ok = match callbacks {
                        Some(callbacks) if writeback => callbacks.writeback().await,
                        Some(callbacks) => callbacks.invalidate().await,
                        None => Ok(false),
                    };
                    let ok = ok.unwrap_or_else(|e| {
                        tracing::warn!("Callback failed: {e}");
                        false
                    });
                    let _ = outbox.send(ClientMessage::CallbackResult { request_id, ok });
                });
            }
            ServerMessage::Error { message } => tracing::warn!("Authority error: {message}"),
            _ => {}
        }
    }

    tracing::info!("Connection to authority closed");
    // Dropping the senders fails every outstanding request.
    lock(&pending).clear();
}

async fn next_message<R>(reader: &mut R) -> Option<ServerMessage>
where
    R: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(m) => return Some(m),
            Err(e) => tracing::warn!("Invalid server message: {e}"),
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
