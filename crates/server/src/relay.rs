// Update fan-out for one document.
//
// The relay holds the outbound transport handle of every subscribed client
// and delivers messages to all of them except the sender. It is content
// agnostic: payloads pass through unmodified. A failed delivery never
// aborts the others; failing subscribers are reported back so the owning
// session can evict them.

use std::collections::HashMap;

use coscribe_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Result of one publish call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers that received the message.
    pub delivered: usize,
    /// Subscribers whose transport is gone; schedule them for eviction.
    pub failed: Vec<Uuid>,
}

/// Per-document fan-out map: client id -> outbound sender.
#[derive(Debug, Default)]
pub struct UpdateRelay {
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<WsMessage>>,
}

impl UpdateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, client_id: Uuid, sender: mpsc::UnboundedSender<WsMessage>) {
        self.subscribers.insert(client_id, sender);
    }

    pub fn unsubscribe(&mut self, client_id: Uuid) -> bool {
        self.subscribers.remove(&client_id).is_some()
    }

    pub fn contains(&self, client_id: Uuid) -> bool {
        self.subscribers.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `message` to every subscriber except `exclude`.
    pub fn publish(&self, exclude: Option<Uuid>, message: &WsMessage) -> Delivery {
        let mut delivery = Delivery::default();
        for (client_id, sender) in &self.subscribers {
            if Some(*client_id) == exclude {
                continue;
            }
            if sender.send(message.clone()).is_ok() {
                delivery.delivered += 1;
            } else {
                warn!(client_id = %client_id, "subscriber transport closed; scheduling eviction");
                delivery.failed.push(*client_id);
            }
        }
        delivery
    }

    /// Deliver to a single subscriber.
    pub fn send_to(&self, client_id: Uuid, message: WsMessage) -> bool {
        self.subscribers
            .get(&client_id)
            .map(|sender| sender.send(message).is_ok())
            .unwrap_or(false)
    }
}
