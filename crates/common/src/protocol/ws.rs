// WebSocket message types for the coscribe-sync.v1 protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CURRENT_PROTOCOL_VERSION: &str = "coscribe-sync.v1";

/// All message types in the coscribe-sync.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: open (or attach to) a document.
    Join {
        doc_id: Uuid,
        client_id: Uuid,
        display_name: String,
    },

    /// Client -> Server: detach from a document.
    Leave {
        doc_id: Uuid,
        client_id: Uuid,
    },

    /// Server -> Client: full document snapshot for catch-up.
    Snapshot {
        doc_id: Uuid,
        version: i64,
        payload_b64: String,
    },

    /// Bidirectional: an opaque CRDT update.
    ContentDelta {
        doc_id: Uuid,
        client_id: Uuid,
        payload_b64: String,
    },

    /// Bidirectional: a cursor/selection update for one client.
    Presence {
        doc_id: Uuid,
        client_id: Uuid,
        display_name: String,
        cursor: serde_json::Value,
    },

    /// Server -> Client: a peer's presence entry went away.
    PresenceRemoved {
        doc_id: Uuid,
        client_id: Uuid,
    },

    /// Client -> Server: start an AI query anchored at a placeholder node.
    QueryStart {
        doc_id: Uuid,
        client_id: Uuid,
        query_id: Uuid,
        anchor_id: Uuid,
        question: String,
    },

    /// Server -> Client: a streamed response chunk for live rendering.
    QueryChunk {
        doc_id: Uuid,
        query_id: Uuid,
        anchor_id: Uuid,
        text: String,
    },

    /// Server -> Client: the query finished and its content was spliced in.
    QueryDone {
        doc_id: Uuid,
        query_id: Uuid,
        text: String,
    },

    /// Server -> Client: the query failed; the placeholder stays for retry.
    QueryError {
        doc_id: Uuid,
        query_id: Uuid,
        kind: QueryErrorKind,
        reason: String,
    },

    /// Client -> Server: abort an in-flight query.
    QueryCancel {
        doc_id: Uuid,
        query_id: Uuid,
    },

    /// Server -> Client: the query was cancelled; revert the placeholder.
    QueryCancelled {
        doc_id: Uuid,
        query_id: Uuid,
    },

    /// Server -> Client: durable save failed; editing continues.
    SaveFailed {
        doc_id: Uuid,
        message: String,
    },

    /// Server -> Client: protocol-level error.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        doc_id: Option<Uuid>,
    },
}

/// Why a query ended in `QueryError`. Clients word the failure differently
/// per kind ("generation failed" vs "content changed before the response
/// was ready").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// The generation backend failed or timed out.
    Generation,
    /// The generated text could not be parsed into content nodes.
    Parse,
    /// The anchor was concurrently deleted; splice refused to re-insert.
    Conflict,
}

/// Encode an opaque binary payload for the JSON framing.
pub fn encode_payload(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Decode a `payload_b64` field back into bytes.
pub fn decode_payload(payload_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(payload_b64)
}
