// CRDT document wrapper using yrs (y-crdt Rust bindings).
//
// Update blobs stay opaque to the rest of the server: `apply_update` merges
// whatever clients send, `encode_state` produces the snapshot handed to
// joining clients and the persistence store. The one schema-aware touch
// point is the node tree carried as JSON under a named map key, which the
// splice path reads and rewrites through a normal yrs transaction so its
// result broadcasts as an ordinary update.

use anyhow::{Context, Result};
use coscribe_common::node::BlockNode;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Map, ReadTxn, StateVector, Transact, Update};

const DOC_MAP: &str = "document";
const TREE_KEY: &str = "tree";

/// Wrapper around a yrs document for one editing session.
pub struct CrdtDoc {
    doc: Doc,
}

impl CrdtDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a document from a binary state (full snapshot).
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let doc = Doc::new();
        let update = Update::decode_v1(data).context("failed to decode CRDT state")?;
        doc.transact_mut().apply_update(update).context("failed to apply CRDT state update")?;
        Ok(Self { doc })
    }

    /// Apply an incremental binary update to the document.
    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode CRDT update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply CRDT update")?;
        Ok(())
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Read the node tree carried in the document, if any.
    pub fn read_tree(&self) -> Result<Vec<BlockNode>> {
        let map = self.doc.get_or_insert_map(DOC_MAP);
        let txn = self.doc.transact();
        let Some(raw) = map.get(&txn, TREE_KEY).map(|value| value.to_string(&txn)) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).context("document tree JSON is invalid")
    }

    /// Replace the node tree and return the update blob produced by the
    /// transaction, ready for broadcast as a normal content delta.
    pub fn write_tree(&self, tree: &[BlockNode]) -> Result<Vec<u8>> {
        let encoded = serde_json::to_string(tree).context("failed to encode document tree")?;
        let map = self.doc.get_or_insert_map(DOC_MAP);
        let mut txn = self.doc.transact_mut();
        map.insert(&mut txn, TREE_KEY, encoded);
        Ok(txn.encode_update_v1())
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}
