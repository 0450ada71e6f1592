//! Authority and agents talking over real WebSocket connections.

#![cfg(feature = "websocket")]

use std::{future::Future, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use shared_cache_authority::{ClientDirectory, Coordinator};
use shared_cache_core::{
    AccessMode, AuthorityConfig, AuthorityState, ClientCacheState, ClientId, CoherenceError,
    FileContents,
};
use shared_cache_store::MemoryStore;
use shared_cache_transport::{
    ClientMessage, ServerMessage, WireError, connect_agent, create_authority_router,
};
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const FILE: &str = "report.txt";

async fn start_server() -> (String, Arc<Coordinator<MemoryStore>>) {
    let store = MemoryStore::with_files([(FILE, "v1")]);
    let config = AuthorityConfig::default().with_callback_timeout(Duration::from_secs(2));
    let authority = Arc::new(Coordinator::new(store, ClientDirectory::new(), config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_authority_router(Arc::clone(&authority));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}/ws"), authority)
}

/// Fail instead of hanging if the protocol stalls.
async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}

#[tokio::test]
async fn test_ownership_handoff_over_websocket() {
    bounded(async {
        let (url, authority) = start_server().await;
        let c1 = assert_ok!(connect_agent(&url, ClientId::from("c1")).await);
        let c2 = assert_ok!(connect_agent(&url, ClientId::from("c2")).await);
        assert_eq!(authority.directory().len(), 2);

        assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Write).await);
        assert_ok!(c1.update_contents("v2"));

        // c2's request triggers a writeback round trip through c1's connection.
        let contents = assert_ok!(c2.acquire_if_needed(FILE, AccessMode::Write).await);
        assert_eq!(contents.as_bytes(), b"v2");
        assert_eq!(c1.state(), ClientCacheState::ReadShared);
        assert_eq!(authority.store().get(FILE), Some(FileContents::from("v2")));

        assert_ok!(c2.update_contents("v3"));
        let report = assert_ok!(c2.commit_local().await);
        assert!(report.degraded.is_empty());
        assert_eq!(c1.state(), ClientCacheState::Invalid);

        let snap = authority.snapshot(FILE).await.unwrap();
        assert_eq!(snap.state, AuthorityState::NotShared);
        assert_eq!(snap.contents, FileContents::from("v3"));
    })
    .await;
}

#[tokio::test]
async fn test_missing_file_over_websocket() {
    bounded(async {
        let (url, _authority) = start_server().await;
        let c1 = assert_ok!(connect_agent(&url, ClientId::from("c1")).await);

        let err = assert_err!(c1.acquire_if_needed("missing.txt", AccessMode::Read).await);
        assert!(matches!(
            err,
            shared_cache_agent::AgentError::Authority(CoherenceError::NotFound(_))
        ));
        assert_eq!(c1.state(), ClientCacheState::Invalid);
    })
    .await;
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    bounded(async {
        let (url, authority) = start_server().await;
        let c1 = assert_ok!(connect_agent(&url, ClientId::from("c1")).await);
        assert_eq!(authority.directory().len(), 1);

        drop(c1);
        while !authority.directory().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_raw_protocol_rejects_bad_mode_and_requires_registration() {
    bounded(async {
        let (url, _authority) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let send = |msg: &ClientMessage| Message::text(serde_json::to_string(msg).unwrap());
        let recv = |msg: Message| -> ServerMessage {
            serde_json::from_str(msg.to_text().unwrap()).unwrap()
        };

        let early = Uuid::new_v4();
        ws.send(send(&ClientMessage::Acquire {
            request_id: early,
            filename: FILE.to_string(),
            mode: "r".to_string(),
        }))
        .await
        .unwrap();
        let reply = recv(ws.next().await.unwrap().unwrap());
        assert!(matches!(
            reply,
            ServerMessage::Failed {
                request_id,
                error: WireError::Transport { .. },
            } if request_id == early
        ));

        ws.send(send(&ClientMessage::Register {
            client_id: ClientId::from("raw"),
        }))
        .await
        .unwrap();
        let reply = recv(ws.next().await.unwrap().unwrap());
        assert_eq!(
            reply,
            ServerMessage::Registered {
                client_id: ClientId::from("raw")
            }
        );

        let bad = Uuid::new_v4();
        ws.send(send(&ClientMessage::Acquire {
            request_id: bad,
            filename: FILE.to_string(),
            mode: "x".to_string(),
        }))
        .await
        .unwrap();
        let reply = recv(ws.next().await.unwrap().unwrap());
        assert_eq!(
            reply,
            ServerMessage::Failed {
                request_id: bad,
                error: WireError::InvalidMode {
                    mode: "x".to_string()
                },
            }
        );

        let read = Uuid::new_v4();
        ws.send(send(&ClientMessage::Acquire {
            request_id: read,
            filename: FILE.to_string(),
            mode: "r".to_string(),
        }))
        .await
        .unwrap();
        let reply = recv(ws.next().await.unwrap().unwrap());
        assert_eq!(reply.reply_to(), Some(read));
        assert_eq!(reply.decode_acquired(), Some(FileContents::from("v1")));
    })
    .await;
}
