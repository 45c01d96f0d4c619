// Per-document session actor.
//
// One tokio task per active document. Every mutating operation arrives
// through the session's command queue, so there is exactly one writer per
// document and relay order always matches arrival order — no locks. The
// relay, presence tracker, debouncer and in-flight query map are owned by
// the actor; background work (generation pumps) re-enters through the
// queue instead of touching state directly.
//
// Lifecycle: spawned on first join, exits after the last client leaves
// (forced flush, in-flight queries force-cancelled) or on shutdown. Joins
// that race into a closing session's queue are re-routed to a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use coscribe_common::markdown::parse_markdown;
use coscribe_common::protocol::ws::{encode_payload, QueryErrorKind, WsMessage};
use coscribe_common::splice::{apply_ops, splice, SpliceError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionTimings;
use crate::crdt::CrdtDoc;
use crate::debounce::SaveDebouncer;
use crate::generation::{GenerationBackend, GenerationEvent};
use crate::presence::PresenceTracker;
use crate::query::{spawn_query_pump, AgentQuery};
use crate::registry::SessionRegistry;
use crate::relay::UpdateRelay;
use crate::store::SnapshotStore;

/// Server-originated deltas (AI splices) carry the nil client id.
pub const SERVER_CLIENT_ID: Uuid = Uuid::nil();

/// Commands accepted by a document session.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        client_id: Uuid,
        display_name: String,
        outbound: mpsc::UnboundedSender<WsMessage>,
    },
    Leave {
        client_id: Uuid,
    },
    ContentDelta {
        client_id: Uuid,
        payload: Vec<u8>,
    },
    Presence {
        client_id: Uuid,
        cursor: serde_json::Value,
    },
    QueryStart {
        client_id: Uuid,
        query_id: Uuid,
        anchor_id: Uuid,
        question: String,
    },
    QueryCancel {
        query_id: Uuid,
    },
    /// From a query pump task, never from a client.
    QueryEvent {
        query_id: Uuid,
        event: GenerationEvent,
    },
    /// Graceful shutdown: flush and exit.
    Shutdown,
}

/// Shared dependencies injected into every session.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<SnapshotStore>,
    pub backend: Arc<dyn GenerationBackend>,
    pub timings: SessionTimings,
}

/// Cheap handle for sending commands into a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    doc_id: Uuid,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Returns false when the session has exited.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub(crate) fn same_channel(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Spawn the actor for a document. Callers go through the registry so the
/// one-session-per-document invariant holds.
pub(crate) fn spawn(
    doc_id: Uuid,
    ctx: SessionContext,
    registry: SessionRegistry,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle { doc_id, tx };
    let task = tokio::spawn(run(doc_id, ctx, rx, handle.clone(), registry));
    (handle, task)
}

async fn run(
    doc_id: Uuid,
    ctx: SessionContext,
    mut inbox: mpsc::UnboundedReceiver<SessionCommand>,
    self_handle: SessionHandle,
    registry: SessionRegistry,
) {
    let mut session = DocumentSession::new(doc_id, ctx, self_handle.clone());
    session.load_snapshot();
    info!(doc_id = %doc_id, "document session active");

    let mut sweep = interval(session.ctx.timings.presence_sweep);

    loop {
        let save_deadline = session.debouncer.deadline();
        let exit = tokio::select! {
            command = inbox.recv() => match command {
                Some(command) => session.handle_command(command),
                None => true,
            },
            _ = deadline_elapsed(save_deadline) => {
                session.save_due(Instant::now());
                false
            }
            _ = sweep.tick() => {
                session.sweep_presence(Instant::now());
                false
            }
        };

        if exit {
            session.shutdown_flush();
            break;
        }

        if session.should_drain() {
            info!(doc_id = %doc_id, "last client left; draining");
            session.shutdown_flush();
            break;
        }
    }

    registry.deregister(doc_id, &self_handle).await;
    info!(doc_id = %doc_id, "document session closed");

    // Joins that raced into this queue get a fresh session; everything else
    // addressed a session that no longer exists.
    while let Ok(command) = inbox.try_recv() {
        if let SessionCommand::Join { client_id, display_name, outbound } = command {
            registry.route_join(doc_id, client_id, display_name, outbound).await;
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct InflightQuery {
    query: AgentQuery,
    pump: JoinHandle<()>,
}

struct DocumentSession {
    doc_id: Uuid,
    ctx: SessionContext,
    self_handle: SessionHandle,
    relay: UpdateRelay,
    presence: PresenceTracker,
    debouncer: SaveDebouncer,
    doc: CrdtDoc,
    version: i64,
    clients: HashMap<Uuid, String>,
    queries: HashMap<Uuid, InflightQuery>,
    ever_joined: bool,
}

impl DocumentSession {
    fn new(doc_id: Uuid, ctx: SessionContext, self_handle: SessionHandle) -> Self {
        let debouncer =
            SaveDebouncer::new(ctx.timings.debounce_quiet, ctx.timings.save_retry_backoff);
        Self {
            doc_id,
            ctx,
            self_handle,
            relay: UpdateRelay::new(),
            presence: PresenceTracker::new(),
            debouncer,
            doc: CrdtDoc::new(),
            version: 0,
            clients: HashMap::new(),
            queries: HashMap::new(),
            ever_joined: false,
        }
    }

    fn load_snapshot(&mut self) {
        match self.ctx.store.load(self.doc_id) {
            Ok(Some(record)) => match CrdtDoc::from_state(&record.payload) {
                Ok(doc) => {
                    self.doc = doc;
                    self.version = record.version;
                    info!(doc_id = %self.doc_id, version = record.version, "loaded durable snapshot");
                }
                Err(error) => {
                    warn!(doc_id = %self.doc_id, %error, "snapshot blob is corrupt; starting empty");
                }
            },
            Ok(None) => debug!(doc_id = %self.doc_id, "no durable snapshot; starting empty"),
            Err(error) => {
                warn!(doc_id = %self.doc_id, %error, "snapshot load failed; starting empty");
            }
        }
    }

    /// Returns true when the session should exit.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Join { client_id, display_name, outbound } => {
                self.handle_join(client_id, display_name, outbound);
            }
            SessionCommand::Leave { client_id } => {
                self.drop_client(client_id);
                info!(doc_id = %self.doc_id, client_id = %client_id, clients = self.clients.len(), "client left");
            }
            SessionCommand::ContentDelta { client_id, payload } => {
                self.handle_content_delta(client_id, payload);
            }
            SessionCommand::Presence { client_id, cursor } => {
                self.handle_presence(client_id, cursor);
            }
            SessionCommand::QueryStart { client_id, query_id, anchor_id, question } => {
                self.handle_query_start(client_id, query_id, anchor_id, question);
            }
            SessionCommand::QueryCancel { query_id } => {
                self.handle_query_cancel(query_id);
            }
            SessionCommand::QueryEvent { query_id, event } => {
                self.handle_query_event(query_id, event);
            }
            SessionCommand::Shutdown => return true,
        }
        false
    }

    fn handle_join(
        &mut self,
        client_id: Uuid,
        display_name: String,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) {
        self.ever_joined = true;

        let payload = self.doc.encode_state();
        let snapshot = WsMessage::Snapshot {
            doc_id: self.doc_id,
            version: self.version,
            payload_b64: encode_payload(&payload),
        };
        if outbound.send(snapshot).is_err() {
            warn!(doc_id = %self.doc_id, client_id = %client_id, "client gone before join completed");
            return;
        }

        // Seed the joiner with the current presence set.
        for (peer_id, entry) in self.presence.entries() {
            let _ = outbound.send(WsMessage::Presence {
                doc_id: self.doc_id,
                client_id: peer_id,
                display_name: entry.display_name.clone(),
                cursor: entry.cursor.clone(),
            });
        }

        self.relay.subscribe(client_id, outbound);
        self.clients.insert(client_id, display_name);
        info!(doc_id = %self.doc_id, client_id = %client_id, clients = self.clients.len(), "client joined");
    }

    fn handle_content_delta(&mut self, client_id: Uuid, payload: Vec<u8>) {
        if let Err(error) = self.doc.apply_update(&payload) {
            warn!(doc_id = %self.doc_id, client_id = %client_id, %error, "rejecting invalid update");
            self.relay.send_to(
                client_id,
                WsMessage::Error {
                    code: "INVALID_UPDATE".to_string(),
                    message: error.to_string(),
                    retryable: false,
                    doc_id: Some(self.doc_id),
                },
            );
            return;
        }

        self.publish(
            Some(client_id),
            WsMessage::ContentDelta {
                doc_id: self.doc_id,
                client_id,
                payload_b64: encode_payload(&payload),
            },
        );
        self.debouncer.signal(Instant::now());
    }

    fn handle_presence(&mut self, client_id: Uuid, cursor: serde_json::Value) {
        let display_name = self.clients.get(&client_id).cloned().unwrap_or_default();
        self.presence.update(client_id, display_name.clone(), cursor.clone(), Instant::now());
        self.publish(
            Some(client_id),
            WsMessage::Presence { doc_id: self.doc_id, client_id, display_name, cursor },
        );
    }

    fn handle_query_start(
        &mut self,
        client_id: Uuid,
        query_id: Uuid,
        anchor_id: Uuid,
        question: String,
    ) {
        if self.queries.contains_key(&query_id) {
            warn!(doc_id = %self.doc_id, query_id = %query_id, "duplicate query id ignored");
            self.relay.send_to(
                client_id,
                WsMessage::Error {
                    code: "DUPLICATE_QUERY".to_string(),
                    message: format!("query {query_id} is already in flight"),
                    retryable: false,
                    doc_id: Some(self.doc_id),
                },
            );
            return;
        }

        let events = self.ctx.backend.generate(&question);
        let pump = spawn_query_pump(
            query_id,
            events,
            self.ctx.timings.generation_timeout,
            self.self_handle.tx.clone(),
        );
        self.queries
            .insert(query_id, InflightQuery { query: AgentQuery::new(query_id, anchor_id, question), pump });
        info!(doc_id = %self.doc_id, query_id = %query_id, client_id = %client_id, "query dispatched");
    }

    fn handle_query_cancel(&mut self, query_id: Uuid) {
        let Some(mut inflight) = self.queries.remove(&query_id) else {
            debug!(doc_id = %self.doc_id, query_id = %query_id, "cancel for unknown query ignored");
            return;
        };
        inflight.pump.abort();
        inflight.query.mark_cancelled();
        info!(doc_id = %self.doc_id, query_id = %query_id, "query cancelled");
        self.publish(None, WsMessage::QueryCancelled { doc_id: self.doc_id, query_id });
    }

    fn handle_query_event(&mut self, query_id: Uuid, event: GenerationEvent) {
        match event {
            GenerationEvent::Chunk(text) => {
                let anchor_id = match self.queries.get_mut(&query_id) {
                    Some(inflight) => {
                        inflight.query.accept_chunk(&text).then_some(inflight.query.anchor_id)
                    }
                    None => {
                        debug!(doc_id = %self.doc_id, query_id = %query_id, "chunk for finished query dropped");
                        None
                    }
                };
                if let Some(anchor_id) = anchor_id {
                    self.publish(
                        None,
                        WsMessage::QueryChunk { doc_id: self.doc_id, query_id, anchor_id, text },
                    );
                }
            }
            GenerationEvent::Done => {
                let Some(inflight) = self.queries.remove(&query_id) else {
                    debug!(doc_id = %self.doc_id, query_id = %query_id, "completion for finished query dropped");
                    return;
                };
                self.finish_query(inflight.query);
            }
            GenerationEvent::Error(reason) => {
                let Some(mut inflight) = self.queries.remove(&query_id) else {
                    debug!(doc_id = %self.doc_id, query_id = %query_id, "error for finished query dropped");
                    return;
                };
                inflight.query.mark_error();
                warn!(doc_id = %self.doc_id, query_id = %query_id, reason = %reason, "generation failed");
                self.publish(
                    None,
                    WsMessage::QueryError {
                        doc_id: self.doc_id,
                        query_id,
                        kind: QueryErrorKind::Generation,
                        reason,
                    },
                );
            }
        }
    }

    /// Parse the accumulated text, splice it at the anchor and broadcast the
    /// result as a normal content delta. Failures leave the placeholder in
    /// place for a manual retry under a new query id.
    fn finish_query(&mut self, mut query: AgentQuery) {
        let query_id = query.id;
        let full_text = query.buffer.clone();

        let parsed = match parse_markdown(&full_text) {
            Ok(parsed) => parsed,
            Err(error) => {
                query.mark_error();
                warn!(doc_id = %self.doc_id, query_id = %query_id, %error, "generated content failed to parse");
                self.publish_query_error(query_id, QueryErrorKind::Parse, error.to_string());
                return;
            }
        };

        let tree = match self.doc.read_tree() {
            Ok(tree) => tree,
            Err(error) => {
                query.mark_error();
                warn!(doc_id = %self.doc_id, query_id = %query_id, %error, "document tree unreadable");
                self.publish_query_error(query_id, QueryErrorKind::Conflict, error.to_string());
                return;
            }
        };

        let ops = match splice(&tree, query.anchor_id, &parsed) {
            Ok(ops) => ops,
            Err(error @ SpliceError::AnchorNotFound { .. }) => {
                query.mark_error();
                info!(doc_id = %self.doc_id, query_id = %query_id, "anchor deleted before response was ready");
                self.publish_query_error(query_id, QueryErrorKind::Conflict, error.to_string());
                return;
            }
            Err(error @ SpliceError::ContentUnparsable(_)) => {
                query.mark_error();
                self.publish_query_error(query_id, QueryErrorKind::Parse, error.to_string());
                return;
            }
        };

        let next_tree = apply_ops(tree, &ops);
        match self.doc.write_tree(&next_tree) {
            Ok(update) => {
                query.mark_done();
                self.publish(
                    None,
                    WsMessage::ContentDelta {
                        doc_id: self.doc_id,
                        client_id: SERVER_CLIENT_ID,
                        payload_b64: encode_payload(&update),
                    },
                );
                self.debouncer.signal(Instant::now());
                self.publish(
                    None,
                    WsMessage::QueryDone { doc_id: self.doc_id, query_id, text: full_text },
                );
                info!(doc_id = %self.doc_id, query_id = %query_id, "query content spliced");
            }
            Err(error) => {
                query.mark_error();
                warn!(doc_id = %self.doc_id, query_id = %query_id, %error, "failed to apply splice");
                self.publish_query_error(query_id, QueryErrorKind::Conflict, error.to_string());
            }
        }
    }

    fn publish_query_error(&mut self, query_id: Uuid, kind: QueryErrorKind, reason: String) {
        self.publish(
            None,
            WsMessage::QueryError { doc_id: self.doc_id, query_id, kind, reason },
        );
    }

    /// Fan out via the relay; subscribers with a dead transport are evicted.
    fn publish(&mut self, exclude: Option<Uuid>, message: WsMessage) {
        let delivery = self.relay.publish(exclude, &message);
        for client_id in delivery.failed {
            self.drop_client(client_id);
        }
    }

    fn drop_client(&mut self, client_id: Uuid) {
        self.relay.unsubscribe(client_id);
        self.clients.remove(&client_id);
        if self.presence.evict(client_id) {
            self.publish(None, WsMessage::PresenceRemoved { doc_id: self.doc_id, client_id });
        }
    }

    fn should_drain(&self) -> bool {
        self.ever_joined && self.clients.is_empty()
    }

    fn save_due(&mut self, now: Instant) {
        if self.debouncer.take_due(now) {
            self.persist(now);
        }
    }

    fn persist(&mut self, now: Instant) {
        let payload = self.doc.encode_state();
        let next_version = self.version + 1;
        match self.ctx.store.save(self.doc_id, next_version, &payload) {
            Ok(_) => {
                self.version = next_version;
                self.debouncer.saved();
                debug!(doc_id = %self.doc_id, version = next_version, bytes = payload.len(), "snapshot persisted");
            }
            Err(error) => {
                warn!(doc_id = %self.doc_id, %error, "snapshot persistence failed");
                if !self.debouncer.schedule_retry(now) {
                    warn!(doc_id = %self.doc_id, "snapshot retry exhausted; unsaved changes remain");
                    self.publish(
                        None,
                        WsMessage::SaveFailed {
                            doc_id: self.doc_id,
                            message: "changes could not be saved and remain unsaved".to_string(),
                        },
                    );
                }
            }
        }
    }

    /// Forced flush for drain and shutdown: one attempt plus one immediate
    /// retry, bypassing the backoff the teardown cannot wait for.
    fn flush_now(&mut self) {
        if !self.debouncer.take_flush() {
            return;
        }
        let payload = self.doc.encode_state();
        let next_version = self.version + 1;
        let result = self
            .ctx
            .store
            .save(self.doc_id, next_version, &payload)
            .or_else(|error| {
                warn!(doc_id = %self.doc_id, %error, "final flush failed; retrying once");
                self.ctx.store.save(self.doc_id, next_version, &payload)
            });
        match result {
            Ok(_) => {
                self.version = next_version;
                self.debouncer.saved();
                debug!(doc_id = %self.doc_id, version = next_version, "final snapshot flushed");
            }
            Err(error) => {
                warn!(doc_id = %self.doc_id, %error, "final flush failed; latest changes were not persisted");
                self.publish(
                    None,
                    WsMessage::SaveFailed {
                        doc_id: self.doc_id,
                        message: "changes could not be saved and remain unsaved".to_string(),
                    },
                );
            }
        }
    }

    fn shutdown_flush(&mut self) {
        self.flush_now();
        self.cancel_all_queries();
    }

    fn cancel_all_queries(&mut self) {
        for (query_id, mut inflight) in std::mem::take(&mut self.queries) {
            inflight.pump.abort();
            inflight.query.mark_cancelled();
            debug!(doc_id = %self.doc_id, query_id = %query_id, "query force-cancelled during teardown");
            self.publish(None, WsMessage::QueryCancelled { doc_id: self.doc_id, query_id });
        }
    }

    fn sweep_presence(&mut self, now: Instant) {
        for client_id in self.presence.sweep(self.ctx.timings.presence_ttl, now) {
            self.publish(None, WsMessage::PresenceRemoved { doc_id: self.doc_id, client_id });
        }
    }
}
