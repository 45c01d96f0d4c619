// Document id -> session registry.
//
// The only globally shared mutable structure in the server. Insert-if-absent
// under one lock guarantees at most one live session per document; a racer
// that loses simply attaches to the winner's handle. Deregistration is
// channel-identity checked so a session tearing down can never remove a
// successor registered under the same document id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use coscribe_common::protocol::ws::WsMessage;

use crate::session::{self, SessionCommand, SessionContext, SessionHandle};

struct RegisteredSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, RegisteredSession>>>,
    ctx: Arc<SessionContext>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), ctx: Arc::new(ctx) }
    }

    /// Get the live session for a document, creating it if absent.
    pub async fn handle_for(&self, doc_id: Uuid) -> SessionHandle {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get(&doc_id) {
            return entry.handle.clone();
        }
        let (handle, task) = session::spawn(doc_id, (*self.ctx).clone(), self.clone());
        guard.insert(doc_id, RegisteredSession { handle: handle.clone(), task });
        debug!(doc_id = %doc_id, "session registered");
        handle
    }

    /// Route a join, retrying past sessions that exited between lookup and
    /// delivery so no join is ever lost to a teardown race.
    pub async fn route_join(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        display_name: String,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) {
        loop {
            let handle = self.handle_for(doc_id).await;
            let delivered = handle.send(SessionCommand::Join {
                client_id,
                display_name: display_name.clone(),
                outbound: outbound.clone(),
            });
            if delivered {
                return;
            }
            self.remove_if_same(doc_id, &handle).await;
        }
    }

    /// Send a command to the document's session, if one is active.
    pub async fn send(&self, doc_id: Uuid, command: SessionCommand) -> bool {
        let handle =
            self.inner.lock().await.get(&doc_id).map(|entry| entry.handle.clone());
        match handle {
            Some(handle) => handle.send(command),
            None => false,
        }
    }

    /// Called by a session as it exits.
    pub(crate) async fn deregister(&self, doc_id: Uuid, handle: &SessionHandle) {
        self.remove_if_same(doc_id, handle).await;
    }

    async fn remove_if_same(&self, doc_id: Uuid, handle: &SessionHandle) {
        let mut guard = self.inner.lock().await;
        let matches = guard
            .get(&doc_id)
            .map(|entry| entry.handle.same_channel(handle))
            .unwrap_or(false);
        if matches {
            guard.remove(&doc_id);
            debug!(doc_id = %doc_id, "session deregistered");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_active(&self, doc_id: Uuid) -> bool {
        self.inner.lock().await.contains_key(&doc_id)
    }

    /// Graceful shutdown: ask every session to flush and wait for them.
    pub async fn shutdown_all(&self) {
        let entries: Vec<RegisteredSession> = {
            let mut guard = self.inner.lock().await;
            guard.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.handle.send(SessionCommand::Shutdown);
        }
        for entry in entries {
            let _ = entry.task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coscribe_common::node::{BlockNode, InlineNode};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;
    use crate::config::SessionTimings;
    use crate::crdt::CrdtDoc;
    use crate::generation::{GenerationBackend, GenerationEvent};
    use crate::store::SnapshotStore;

    struct NeverBackend;

    impl GenerationBackend for NeverBackend {
        fn generate(&self, _question: &str) -> mpsc::Receiver<GenerationEvent> {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                let _keep_open = tx;
                std::future::pending::<()>().await;
            });
            rx
        }
    }

    fn registry_with_store() -> (SessionRegistry, Arc<SnapshotStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let store = Arc::new(SnapshotStore::new(dir.path()).expect("store should initialize"));
        let ctx = SessionContext {
            store: Arc::clone(&store),
            backend: Arc::new(NeverBackend),
            timings: SessionTimings {
                debounce_quiet: Duration::from_millis(300),
                save_retry_backoff: Duration::from_millis(250),
                presence_ttl: Duration::from_secs(30),
                presence_sweep: Duration::from_secs(10),
                generation_timeout: Duration::from_secs(600),
            },
        };
        (SessionRegistry::new(ctx), store, dir)
    }

    async fn join(
        registry: &SessionRegistry,
        doc_id: Uuid,
        name: &str,
    ) -> (Uuid, UnboundedReceiver<WsMessage>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = unbounded_channel();
        registry.route_join(doc_id, client_id, name.to_string(), tx).await;
        (client_id, rx)
    }

    async fn wait_until_inactive(registry: &SessionRegistry, doc_id: Uuid) {
        for _ in 0..200 {
            if !registry.is_active(doc_id).await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session for {doc_id} did not deregister");
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_session_per_document() {
        let (registry, _store, _dir) = registry_with_store();
        let doc_id = Uuid::new_v4();

        let first = registry.handle_for(doc_id).await;
        let second = registry.handle_for(doc_id).await;

        assert!(first.same_channel(&second));
        assert_eq!(registry.active_count().await, 1);

        let other_doc = Uuid::new_v4();
        registry.handle_for(other_doc).await;
        assert_eq!(registry.active_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_count_is_zero_or_one_across_join_leave_sequences() {
        let (registry, _store, _dir) = registry_with_store();
        let doc_id = Uuid::new_v4();

        let (a_id, _a_rx) = join(&registry, doc_id, "Alice").await;
        let (b_id, _b_rx) = join(&registry, doc_id, "Bob").await;
        assert_eq!(registry.active_count().await, 1);

        registry.send(doc_id, SessionCommand::Leave { client_id: a_id }).await;
        assert_eq!(registry.active_count().await, 1);

        registry.send(doc_id, SessionCommand::Leave { client_id: b_id }).await;
        wait_until_inactive(&registry, doc_id).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_drain_gets_a_fresh_session_with_saved_state() {
        let (registry, _store, _dir) = registry_with_store();
        let doc_id = Uuid::new_v4();
        let tree = vec![BlockNode::paragraph(vec![InlineNode::text("kept")])];

        let (a_id, mut a_rx) = join(&registry, doc_id, "Alice").await;
        assert!(a_rx.recv().await.is_some()); // snapshot

        let replica = CrdtDoc::with_client_id(7);
        let update = replica.write_tree(&tree).unwrap();
        registry
            .send(doc_id, SessionCommand::ContentDelta { client_id: a_id, payload: update })
            .await;

        registry.send(doc_id, SessionCommand::Leave { client_id: a_id }).await;
        wait_until_inactive(&registry, doc_id).await;

        // The final flush persisted the state; a rejoin loads it back.
        let (_b_id, mut b_rx) = join(&registry, doc_id, "Bob").await;
        match b_rx.recv().await {
            Some(WsMessage::Snapshot { version, payload_b64, .. }) => {
                assert_eq!(version, 1);
                let payload =
                    coscribe_common::protocol::ws::decode_payload(&payload_b64).unwrap();
                let restored = CrdtDoc::from_state(&payload).unwrap();
                assert_eq!(restored.read_tree().unwrap(), tree);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_all_flushes_and_clears_the_registry() {
        let (registry, store, _dir) = registry_with_store();
        let doc_id = Uuid::new_v4();

        let (a_id, mut a_rx) = join(&registry, doc_id, "Alice").await;
        assert!(a_rx.recv().await.is_some());

        let replica = CrdtDoc::with_client_id(7);
        let update = replica
            .write_tree(&[BlockNode::paragraph(vec![InlineNode::text("dirty")])])
            .unwrap();
        registry
            .send(doc_id, SessionCommand::ContentDelta { client_id: a_id, payload: update })
            .await;

        registry.shutdown_all().await;

        assert_eq!(registry.active_count().await, 0);
        let record = store.load(doc_id).unwrap().expect("flush should persist");
        assert_eq!(record.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_inactive_document_is_a_noop() {
        let (registry, _store, _dir) = registry_with_store();
        let delivered = registry
            .send(Uuid::new_v4(), SessionCommand::Leave { client_id: Uuid::new_v4() })
            .await;
        assert!(!delivered);
    }
}
