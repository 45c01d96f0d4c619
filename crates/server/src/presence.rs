// Ephemeral presence for one document: cursors, selections, names.
//
// Entries are advisory and never persisted; a missed broadcast
// self-corrects on the peer's next update. Eviction happens immediately on
// explicit disconnect, or via the periodic inactivity sweep when no
// disconnect notification ever arrives (network partition).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Last-known presence for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub display_name: String,
    /// Opaque cursor/selection descriptor; any serializable value.
    pub cursor: serde_json::Value,
    pub updated_at: Instant,
}

/// Per-document presence map, owned by the document session.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest descriptor for a client.
    pub fn update(
        &mut self,
        client_id: Uuid,
        display_name: String,
        cursor: serde_json::Value,
        now: Instant,
    ) {
        self.entries.insert(client_id, PresenceEntry { display_name, cursor, updated_at: now });
    }

    /// Remove a client's entry. Returns whether one existed.
    pub fn evict(&mut self, client_id: Uuid) -> bool {
        self.entries.remove(&client_id).is_some()
    }

    /// Evict entries idle longer than `ttl`; returns the evicted client ids.
    pub fn sweep(&mut self, ttl: Duration, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.updated_at) >= ttl)
            .map(|(client_id, _)| *client_id)
            .collect();
        for client_id in &expired {
            self.entries.remove(client_id);
            debug!(client_id = %client_id, "presence entry expired");
        }
        expired
    }

    pub fn get(&self, client_id: Uuid) -> Option<&PresenceEntry> {
        self.entries.get(&client_id)
    }

    /// Iterate current entries, e.g. to seed a newly joined client.
    pub fn entries(&self) -> impl Iterator<Item = (Uuid, &PresenceEntry)> {
        self.entries.iter().map(|(client_id, entry)| (*client_id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
