//! WebSocket endpoint of the authority.
//!
//! Every connection carries one client. The first message must be
//! `register`; afterwards the connection serves `acquire`/`commit` requests
//! and relays `invalidate`/`writeback` callbacks to the client.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitStream};
use shared_cache_authority::Coordinator;
use shared_cache_core::{
    AccessMode, CallbackError, ClientCallbacks, ClientId, CoherenceError, ContentStore,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};

type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Callback handle for a client connected over WebSocket.
///
/// Callbacks are sent as messages and complete when the client answers
/// with a `callback_result` carrying the same request id.
pub struct RemotePeer {
    client: ClientId,
    outbox: Outbox,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
}

impl RemotePeer {
    fn new(client: ClientId, outbox: Outbox) -> Self {
        Self {
            client,
            outbox,
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn call(
        &self,
        make: impl FnOnce(Uuid) -> ServerMessage + Send,
    ) -> Result<bool, CallbackError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);
        // Removes the entry if the caller gives up (e.g. on timeout).
        let _guard = PendingGuard {
            peer: self,
            request_id,
        };

        if self.outbox.send(make(request_id)).is_err() {
            return Err(CallbackError::Unreachable(self.client.clone()));
        }
        rx.await
            .map_err(|_| CallbackError::Transport(format!("connection to {} closed", self.client)))
    }

    fn resolve(&self, request_id: Uuid, ok: bool) {
        match self.pending().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(ok);
            }
            None => tracing::debug!(
                client = %self.client,
                %request_id,
                "Late or unknown callback result"
            ),
        }
    }

    /// Fail every outstanding callback.
    fn close(&self) {
        self.pending().clear();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingGuard<'a> {
    peer: &'a RemotePeer,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.peer.pending().remove(&self.request_id);
    }
}

#[async_trait]
impl ClientCallbacks for RemotePeer {
    async fn invalidate(&self) -> Result<bool, CallbackError> {
        self.call(|request_id| ServerMessage::Invalidate { request_id })
            .await
    }

    async fn writeback(&self) -> Result<bool, CallbackError> {
        self.call(|request_id| ServerMessage::Writeback { request_id })
            .await
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    State(authority): State<Arc<Coordinator<S>>>,
) -> impl IntoResponse
where
    S: ContentStore + 'static,
{
    ws.on_upgrade(|socket| handle_socket(socket, authority))
}

async fn handle_socket<S>(socket: WebSocket, authority: Arc<Coordinator<S>>)
where
    S: ContentStore + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let Some(client) = await_registration(&mut receiver, &tx).await else {
        send_task.abort();
        return;
    };

    let peer = Arc::new(RemotePeer::new(client.clone(), tx.clone()));
    let handle: Arc<dyn ClientCallbacks> = peer.clone();
    authority.directory().register(client.clone(), Arc::clone(&handle));
    let _ = tx.send(ServerMessage::Registered {
        client_id: client.clone(),
    });
    tracing::info!(client = %client, "Client connected");

    while let Some(client_msg) = next_message(&mut receiver, &tx).await {
        match client_msg {
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong);
            }
            ClientMessage::CallbackResult { request_id, ok } => peer.resolve(request_id, ok),
            ClientMessage::Register { .. } => {
                let _ = tx.send(ServerMessage::Error {
                    message: "Already registered".to_string(),
                });
            }
            ClientMessage::Acquire {
                request_id,
                filename,
                mode,
            } => {
                // Requests run on their own tasks so callback results keep flowing.
                let authority = Arc::clone(&authority);
                let client = client.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = match mode.parse::<AccessMode>() {
                        Ok(mode) => authority.acquire(&client, &filename, mode).await,
                        Err(e) => Err(e),
                    };
                    let reply = match result {
                        Ok(contents) => ServerMessage::acquired(request_id, &contents),
                        Err(e) => ServerMessage::failed(request_id, &e),
                    };
                    let _ = tx.send(reply);
                });
            }
            msg @ ClientMessage::Commit { .. } => {
                let contents = msg.decode_commit();
                let ClientMessage::Commit {
                    request_id,
                    filename,
                    ..
                } = msg
                else {
                    continue;
                };
                let authority = Arc::clone(&authority);
                let client = client.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = match contents {
                        Some(contents) => authority.commit(&client, &filename, contents).await,
                        None => Err(CoherenceError::Transport("Invalid base64 data".to_string())),
                    };
                    let reply = match result {
                        Ok(report) => ServerMessage::committed(request_id, report),
                        Err(e) => ServerMessage::failed(request_id, &e),
                    };
                    let _ = tx.send(reply);
                });
            }
        }
    }

    tracing::info!(client = %client, "Client disconnected");
    peer.close();
    authority.directory().unregister_handle(&client, &handle);
    send_task.abort();
}

/// Wait for the `register` message that opens every connection.
async fn await_registration(
    receiver: &mut SplitStream<WebSocket>,
    tx: &Outbox,
) -> Option<ClientId> {
    while let Some(client_msg) = next_message(receiver, tx).await {
        match client_msg {
            ClientMessage::Register { client_id } => return Some(client_id),
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong);
            }
            ClientMessage::Acquire { request_id, .. }
            | ClientMessage::Commit { request_id, .. } => {
                let error = CoherenceError::Transport("Register before sending requests".into());
                let _ = tx.send(ServerMessage::failed(request_id, &error));
            }
            ClientMessage::CallbackResult { .. } => {}
        }
    }
    None
}

/// Next well-formed client message, or `None` once the connection closes.
async fn next_message(
    receiver: &mut SplitStream<WebSocket>,
    tx: &Outbox,
) -> Option<ClientMessage> {
    while let Some(msg) = receiver.next().await {
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
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
            }
        }
    }
    None
}

/// Create the authority router, serving the protocol at `/ws`.
///
/// # Example
/// ```ignore
/// let app = create_authority_router(Arc::new(coordinator));
/// ```
#[must_use]
pub fn create_authority_router<S>(authority: Arc<Coordinator<S>>) -> axum::Router
where
    S: ContentStore + 'static,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .with_state(authority)
}
