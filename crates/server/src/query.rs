// AI query state machine and the supervised pump task.
//
// Each query walks Pending → Streaming → {Done | Error | Cancelled}. The
// pump task awaits the generation backend and forwards events into the
// owning session's command queue — it never touches session state
// directly, so the single-writer invariant holds. Once a query is
// terminal no further event is processed: the session drops events whose
// query id is no longer in its in-flight map.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::generation::GenerationEvent;
use crate::session::SessionCommand;

/// Query lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Streaming,
    Done,
    Error,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One in-flight (or recently finished) AI query.
#[derive(Debug)]
pub struct AgentQuery {
    pub id: Uuid,
    pub anchor_id: Uuid,
    pub question: String,
    pub state: QueryState,
    /// Accumulated response text across chunks.
    pub buffer: String,
}

impl AgentQuery {
    pub fn new(id: Uuid, anchor_id: Uuid, question: String) -> Self {
        Self { id, anchor_id, question, state: QueryState::Pending, buffer: String::new() }
    }

    /// Append a chunk. The first chunk moves Pending → Streaming. Returns
    /// false when the query is terminal — the chunk must be dropped, not
    /// broadcast.
    pub fn accept_chunk(&mut self, text: &str) -> bool {
        match self.state {
            QueryState::Pending => {
                self.state = QueryState::Streaming;
                self.buffer.push_str(text);
                true
            }
            QueryState::Streaming => {
                self.buffer.push_str(text);
                true
            }
            _ => {
                debug!(query_id = %self.id, state = self.state.as_str(), "chunk after terminal state dropped");
                false
            }
        }
    }

    /// Transition to Done. Valid only while non-terminal.
    pub fn mark_done(&mut self) -> bool {
        self.mark_terminal(QueryState::Done)
    }

    /// Transition to Error. Valid only while non-terminal.
    pub fn mark_error(&mut self) -> bool {
        self.mark_terminal(QueryState::Error)
    }

    /// Transition to Cancelled. Valid only while non-terminal.
    pub fn mark_cancelled(&mut self) -> bool {
        self.mark_terminal(QueryState::Cancelled)
    }

    fn mark_terminal(&mut self, state: QueryState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        true
    }
}

/// Forward generation events into the owning session's queue, applying the
/// per-event timeout. A closed or timed-out stream becomes an error event;
/// the task ends after the first terminal event.
pub fn spawn_query_pump(
    query_id: Uuid,
    mut events: mpsc::Receiver<GenerationEvent>,
    timeout: Duration,
    session: mpsc::UnboundedSender<SessionCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match tokio::time::timeout(timeout, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    GenerationEvent::Error("generation stream closed unexpectedly".to_string())
                }
                Err(_) => GenerationEvent::Error(format!(
                    "generation timed out after {}s",
                    timeout.as_secs()
                )),
            };

            let terminal = !matches!(event, GenerationEvent::Chunk(_));
            if session.send(SessionCommand::QueryEvent { query_id, event }).is_err() {
                return;
            }
            if terminal {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn query() -> AgentQuery {
        AgentQuery::new(Uuid::new_v4(), Uuid::new_v4(), "summarize this".to_string())
    }

    #[test]
    fn first_chunk_moves_pending_to_streaming() {
        let mut query = query();
        assert_eq!(query.state, QueryState::Pending);

        assert!(query.accept_chunk("Hel"));
        assert_eq!(query.state, QueryState::Streaming);
        assert!(query.accept_chunk("lo"));
        assert_eq!(query.buffer, "Hello");
    }

    #[test]
    fn chunks_after_terminal_states_are_rejected() {
        for terminal in
            [AgentQuery::mark_done, AgentQuery::mark_error, AgentQuery::mark_cancelled]
        {
            let mut query = query();
            query.accept_chunk("first");
            assert!(terminal(&mut query));
            assert!(!query.accept_chunk("late"));
            assert_eq!(query.buffer, "first");
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut query = query();
        query.accept_chunk("x");
        assert!(query.mark_cancelled());

        assert!(!query.mark_done());
        assert!(!query.mark_error());
        assert!(!query.mark_cancelled());
        assert_eq!(query.state, QueryState::Cancelled);
    }

    #[test]
    fn error_is_valid_from_pending() {
        let mut query = query();
        assert!(query.mark_error());
        assert_eq!(query.state, QueryState::Error);
    }

    #[test]
    fn is_terminal_classification() {
        assert!(!QueryState::Pending.is_terminal());
        assert!(!QueryState::Streaming.is_terminal());
        assert!(QueryState::Done.is_terminal());
        assert!(QueryState::Error.is_terminal());
        assert!(QueryState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn pump_forwards_chunks_then_stops_at_terminal() {
        let query_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(8);
        let (session_tx, mut session_rx) = unbounded_channel();

        let pump = spawn_query_pump(query_id, event_rx, Duration::from_secs(5), session_tx);

        event_tx.send(GenerationEvent::Chunk("a".to_string())).await.unwrap();
        event_tx.send(GenerationEvent::Done).await.unwrap();
        pump.await.unwrap();

        match session_rx.recv().await {
            Some(SessionCommand::QueryEvent { query_id: id, event }) => {
                assert_eq!(id, query_id);
                assert_eq!(event, GenerationEvent::Chunk("a".to_string()));
            }
            other => panic!("expected chunk event, got {other:?}"),
        }
        match session_rx.recv().await {
            Some(SessionCommand::QueryEvent { event, .. }) => {
                assert_eq!(event, GenerationEvent::Done);
            }
            other => panic!("expected done event, got {other:?}"),
        }
        assert!(session_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pump_converts_closed_stream_to_error() {
        let query_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel::<GenerationEvent>(1);
        let (session_tx, mut session_rx) = unbounded_channel();
        drop(event_tx);

        spawn_query_pump(query_id, event_rx, Duration::from_secs(5), session_tx)
            .await
            .unwrap();

        match session_rx.recv().await {
            Some(SessionCommand::QueryEvent { event: GenerationEvent::Error(reason), .. }) => {
                assert!(reason.contains("closed unexpectedly"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pump_converts_silence_to_timeout_error() {
        let query_id = Uuid::new_v4();
        let (_event_tx, event_rx) = mpsc::channel::<GenerationEvent>(1);
        let (session_tx, mut session_rx) = unbounded_channel();

        spawn_query_pump(query_id, event_rx, Duration::from_secs(30), session_tx)
            .await
            .unwrap();

        match session_rx.recv().await {
            Some(SessionCommand::QueryEvent { event: GenerationEvent::Error(reason), .. }) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
    }
}
