//! Agents talking to a real coordinator in-process.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use shared_cache_agent::ClientCacheAgent;
use shared_cache_authority::{ClientDirectory, Coordinator};
use shared_cache_core::{
    AccessMode, AuthorityConfig, AuthorityService, AuthorityState, ClientCacheState, ClientId,
    CoherenceError, CommitReport, FileContents,
};
use shared_cache_store::MemoryStore;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

const FILE: &str = "report.txt";

type Authority = Arc<Coordinator<MemoryStore>>;
type Agent = Arc<ClientCacheAgent<Authority>>;

fn authority() -> Authority {
    let store = MemoryStore::with_files([(FILE, "v1"), ("notes.txt", "n1")]);
    let config = AuthorityConfig::default().with_callback_timeout(Duration::from_secs(2));
    Arc::new(Coordinator::new(store, ClientDirectory::new(), config))
}

fn connect(authority: &Authority, id: &str) -> Agent {
    let agent = Arc::new(ClientCacheAgent::new(ClientId::from(id), authority.clone()));
    authority
        .directory()
        .register(ClientId::from(id), agent.clone());
    agent
}

#[tokio::test]
async fn test_ownership_handoff_between_agents() {
    let authority = authority();
    let c1 = connect(&authority, "c1");
    let c2 = connect(&authority, "c2");

    assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_ok!(c1.update_contents("v2"));

    // c2's request makes c1 write back "v2" before c2 gets the file.
    let contents = assert_ok!(c2.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_eq!(contents.as_bytes(), b"v2");
    assert_eq!(c2.state(), ClientCacheState::WriteOwned);
    assert_eq!(c1.state(), ClientCacheState::ReadShared);
    assert_eq!(authority.store().get(FILE), Some(FileContents::from("v2")));

    // c1 keeps a readable copy until c2 commits.
    assert!(c1.has_usable_copy(FILE, AccessMode::Read));
    assert_ok!(c2.update_contents("v3"));
    let report = assert_ok!(c2.commit_local().await);
    assert!(report.degraded.is_empty());

    assert_eq!(c1.state(), ClientCacheState::Invalid);
    assert_eq!(c2.state(), ClientCacheState::Invalid);
    assert!(!c1.has_usable_copy(FILE, AccessMode::Read));

    let contents = assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Read).await);
    assert_eq!(contents.as_bytes(), b"v3");
}

#[tokio::test]
async fn test_readers_invalidated_by_commit() {
    let authority = authority();
    let writer = connect(&authority, "writer");
    let readers: Vec<Agent> = (0..3)
        .map(|i| connect(&authority, &format!("reader{i}")))
        .collect();

    for reader in &readers {
        assert_ok!(reader.acquire_if_needed(FILE, AccessMode::Read).await);
    }
    assert_ok!(writer.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_ok!(writer.update_contents("v2"));
    assert_ok!(writer.commit_local().await);

    for reader in &readers {
        assert_eq!(reader.state(), ClientCacheState::Invalid);
        let fresh = assert_ok!(reader.acquire_if_needed(FILE, AccessMode::Read).await);
        assert_eq!(fresh.as_bytes(), b"v2");
    }
}

#[tokio::test]
async fn test_switching_files_releases_ownership() {
    let authority = authority();
    let c1 = connect(&authority, "c1");
    let c2 = connect(&authority, "c2");

    assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_ok!(c1.update_contents("edited"));
    assert_ok!(c1.acquire_if_needed("notes.txt", AccessMode::Read).await);

    assert_eq!(authority.store().get(FILE), Some(FileContents::from("edited")));
    let snap = authority.snapshot(FILE).await.unwrap();
    assert!(snap.registrants.is_empty());
    assert_eq!(snap.state, AuthorityState::NotShared);

    // No writeback needed: nobody owns the file any more.
    let contents = assert_ok!(c2.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_eq!(contents.as_bytes(), b"edited");
}

#[tokio::test]
async fn test_handoff_fails_when_owner_is_gone() {
    let authority = authority();
    let c1 = connect(&authority, "c1");
    let c2 = connect(&authority, "c2");

    assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_ok!(c2.acquire_if_needed(FILE, AccessMode::Read).await);

    // c1 has lost its cache, e.g. after a restart, so it refuses writeback.
    let c1_restarted = Arc::new(ClientCacheAgent::new(ClientId::from("c1"), authority.clone()));
    authority
        .directory()
        .register(ClientId::from("c1"), c1_restarted);

    let err = assert_err!(c2.acquire_if_needed(FILE, AccessMode::Write).await);
    assert!(matches!(
        err,
        shared_cache_agent::AgentError::Authority(CoherenceError::OwnershipTransferFailed { .. })
    ));
    assert_eq!(c2.state(), ClientCacheState::ReadShared);
    assert_eq!(c1.state(), ClientCacheState::WriteOwned);

    let snap = authority.snapshot(FILE).await.unwrap();
    assert_eq!(snap.owner(), Some(&ClientId::from("c1")));
    assert_eq!(snap.state, AuthorityState::WriteShared);
}

#[tokio::test]
async fn test_concurrent_writers_keep_single_owner() {
    let authority = authority();
    let agents: Vec<Agent> = (0..6)
        .map(|i| connect(&authority, &format!("c{i}")))
        .collect();

    let tasks: Vec<_> = agents
        .iter()
        .cloned()
        .map(|agent| {
            tokio::spawn(async move {
                for _ in 0..3 {
                    let _ = agent.acquire_if_needed(FILE, AccessMode::Write).await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let owners: Vec<_> = agents
        .iter()
        .filter(|a| a.state() == ClientCacheState::WriteOwned)
        .map(|a| a.client_id().clone())
        .collect();
    let snap = authority.snapshot(FILE).await.unwrap();

    assert_eq!(owners.len(), 1);
    assert_eq!(snap.owner(), owners.first());
}

/// Passes calls through, holding back the first commit until the gate opens.
struct HeldCommit {
    inner: Authority,
    gate: Mutex<Option<Arc<Notify>>>,
}

#[async_trait]
impl AuthorityService for HeldCommit {
    async fn acquire(
        &self,
        client: &ClientId,
        filename: &str,
        mode: AccessMode,
    ) -> Result<FileContents, CoherenceError> {
        self.inner.acquire(client, filename, mode).await
    }

    async fn commit(
        &self,
        client: &ClientId,
        filename: &str,
        contents: FileContents,
    ) -> Result<CommitReport, CoherenceError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.inner.commit(client, filename, contents).await
    }
}

#[tokio::test]
async fn test_flush_racing_writeback_succeeds_on_both_sides() {
    let authority = authority();
    let gate = Arc::new(Notify::new());
    let held = Arc::new(HeldCommit {
        inner: authority.clone(),
        gate: Mutex::new(Some(Arc::clone(&gate))),
    });
    let c1 = Arc::new(ClientCacheAgent::new(ClientId::from("c1"), Arc::clone(&held)));
    authority.directory().register(ClientId::from("c1"), c1.clone());
    let c2 = connect(&authority, "c2");

    assert_ok!(c1.acquire_if_needed(FILE, AccessMode::Write).await);
    assert_ok!(c1.update_contents("edited"));

    // c1 switches files; its flush is held back before reaching the authority.
    let switch = tokio::spawn({
        let c1 = c1.clone();
        async move { c1.acquire_if_needed("notes.txt", AccessMode::Read).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while held.gate.lock().unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flush never started");

    // c2's write request starts a transfer, and the writeback reaches c1
    // while its own flush is still in flight.
    let write = tokio::spawn({
        let c2 = c2.clone();
        async move { c2.acquire_if_needed(FILE, AccessMode::Write).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while authority.snapshot(FILE).await.unwrap().state != AuthorityState::OwnershipChange {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transfer never started");
    gate.notify_one();

    let notes = assert_ok!(switch.await.unwrap());
    assert_eq!(notes.as_bytes(), b"n1");
    let contents = assert_ok!(write.await.unwrap());
    assert_eq!(contents.as_bytes(), b"edited");

    assert_eq!(authority.store().get(FILE), Some(FileContents::from("edited")));
    assert_eq!(c1.current_file().as_deref(), Some("notes.txt"));
    assert_eq!(c2.state(), ClientCacheState::WriteOwned);
    let snap = authority.snapshot(FILE).await.unwrap();
    assert_eq!(snap.owner(), Some(&ClientId::from("c2")));
}
