// WebSocket transport: JSON-framed WsMessage values over one persistent
// connection per client.
//
// Each connection runs a select loop between inbound socket frames and the
// outbound queue its sessions publish into. On disconnect, a leave is sent
// for every document the connection joined, so presence eviction and
// session draining do not depend on clients saying goodbye.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use coscribe_common::protocol::ws::{decode_payload, WsMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::SessionRegistry;
use crate::session::SessionCommand;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_route))
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn ws_route(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    // doc_id -> client_id for every join made over this connection.
    let mut joined: HashMap<Uuid, Uuid> = HashMap::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(frame)) = incoming else {
                    break;
                };
                match frame {
                    Message::Text(text) => {
                        match serde_json::from_str::<WsMessage>(&text) {
                            Ok(message) => {
                                handle_client_frame(message, &state, &outbound_tx, &mut joined)
                                    .await;
                            }
                            Err(error) => {
                                debug!(%error, "undecodable frame");
                                let _ = outbound_tx.send(WsMessage::Error {
                                    code: "VALIDATION_FAILED".to_string(),
                                    message: format!("undecodable frame: {error}"),
                                    retryable: false,
                                    doc_id: None,
                                });
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) | Message::Binary(_) => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        let Ok(text) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for (doc_id, client_id) in joined {
        state.registry.send(doc_id, SessionCommand::Leave { client_id }).await;
    }
}

pub(crate) async fn handle_client_frame(
    message: WsMessage,
    state: &AppState,
    outbound_tx: &mpsc::UnboundedSender<WsMessage>,
    joined: &mut HashMap<Uuid, Uuid>,
) {
    match message {
        WsMessage::Join { doc_id, client_id, display_name } => {
            joined.insert(doc_id, client_id);
            state.registry.route_join(doc_id, client_id, display_name, outbound_tx.clone()).await;
        }
        WsMessage::Leave { doc_id, client_id } => {
            joined.remove(&doc_id);
            state.registry.send(doc_id, SessionCommand::Leave { client_id }).await;
        }
        WsMessage::ContentDelta { doc_id, client_id, payload_b64 } => {
            match decode_payload(&payload_b64) {
                Ok(payload) => {
                    state
                        .registry
                        .send(doc_id, SessionCommand::ContentDelta { client_id, payload })
                        .await;
                }
                Err(error) => {
                    warn!(doc_id = %doc_id, %error, "content delta with invalid base64 payload");
                    let _ = outbound_tx.send(WsMessage::Error {
                        code: "VALIDATION_FAILED".to_string(),
                        message: "payload_b64 is not valid base64".to_string(),
                        retryable: false,
                        doc_id: Some(doc_id),
                    });
                }
            }
        }
        WsMessage::Presence { doc_id, client_id, cursor, .. } => {
            state.registry.send(doc_id, SessionCommand::Presence { client_id, cursor }).await;
        }
        WsMessage::QueryStart { doc_id, client_id, query_id, anchor_id, question } => {
            state
                .registry
                .send(
                    doc_id,
                    SessionCommand::QueryStart { client_id, query_id, anchor_id, question },
                )
                .await;
        }
        WsMessage::QueryCancel { doc_id, query_id } => {
            state.registry.send(doc_id, SessionCommand::QueryCancel { query_id }).await;
        }
        other => {
            debug!(?other, "unexpected client frame");
            let _ = outbound_tx.send(WsMessage::Error {
                code: "VALIDATION_FAILED".to_string(),
                message: "frame type is not accepted from clients".to_string(),
                retryable: false,
                doc_id: None,
            });
        }
    }
}
