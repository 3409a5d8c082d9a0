// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic in-memory host.
//!
//! Backs the executor's own test suite and local development.  Documents,
//! layers, history states, and named snapshots all live in one mutex-held
//! structure; ids are sequential, so runs are reproducible.  Test knobs
//! cover the interesting host behaviors: modal-busy refusals and pruned
//! history states.

use crate::{DocumentInfo, HostBridge, HostError, LayerInfo, StateEntry};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
struct MemoryDocument {
    info: DocumentInfo,
    layers: Vec<LayerInfo>,
    active_layer: Option<i64>,
    next_layer_id: i64,
}

#[derive(Debug, Clone)]
struct Saved {
    entry: StateEntry,
    docs: Vec<MemoryDocument>,
    active: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: Vec<MemoryDocument>,
    active: Option<usize>,
    next_doc_id: i64,
    states: Vec<Saved>,
    next_state_id: i64,
    current_state: Option<i64>,
    snapshots: BTreeMap<String, Saved>,
    modal_held: bool,
    busy_refusals: u32,
}

impl Inner {
    fn push_state(&mut self, name: &str) {
        self.next_state_id += 1;
        let entry = StateEntry { id: self.next_state_id, name: name.to_string() };
        self.current_state = Some(entry.id);
        self.states.push(Saved {
            entry,
            docs: self.docs.clone(),
            active: self.active,
        });
    }

    fn active_doc_mut(&mut self) -> Result<&mut MemoryDocument, HostError> {
        let idx = self.active.ok_or(HostError::InvalidDocument)?;
        self.docs.get_mut(idx).ok_or(HostError::InvalidDocument)
    }

    fn restore(&mut self, saved: &Saved) {
        self.docs = saved.docs.clone();
        self.active = saved.active;
        self.current_state = Some(saved.entry.id);
    }
}

/// In-memory [`HostBridge`] implementation.
#[derive(Debug, Default)]
pub struct MemoryHost {
    inner: Mutex<Inner>,
}

impl MemoryHost {
    /// An empty host: no documents open.
    pub fn new() -> Self {
        Self::default()
    }

    /// A host with one open document and an initial history state.
    pub fn with_document(title: &str) -> Self {
        let host = Self::new();
        host.create_document(title);
        host
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory host lock poisoned")
    }

    // -- Mutators (used by leaf handlers) --------------------------------

    /// Open a new document and make it active.
    pub fn create_document(&self, title: &str) -> DocumentInfo {
        let mut inner = self.lock();
        inner.next_doc_id += 1;
        let info = DocumentInfo { id: inner.next_doc_id, title: title.to_string() };
        inner.docs.push(MemoryDocument {
            info: info.clone(),
            layers: Vec::new(),
            active_layer: None,
            next_layer_id: 0,
        });
        inner.active = Some(inner.docs.len() - 1);
        inner.push_state(&format!("Open \"{title}\""));
        info
    }

    /// Add a layer to the active document and make it the targeted layer.
    pub fn create_layer(&self, name: &str) -> Result<LayerInfo, HostError> {
        let mut inner = self.lock();
        let doc = inner.active_doc_mut()?;
        doc.next_layer_id += 1;
        let layer = LayerInfo { id: doc.next_layer_id, name: name.to_string() };
        doc.layers.push(layer.clone());
        doc.active_layer = Some(layer.id);
        inner.push_state(&format!("New Layer \"{name}\""));
        Ok(layer)
    }

    /// Rename a layer of the active document.
    pub fn rename_layer(&self, id: i64, new_name: &str) -> Result<LayerInfo, HostError> {
        let mut inner = self.lock();
        let doc = inner.active_doc_mut()?;
        let layer = doc
            .layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(HostError::Message(format!("no layer with id {id}")))?;
        layer.name = new_name.to_string();
        let renamed = layer.clone();
        inner.push_state(&format!("Rename Layer \"{new_name}\""));
        Ok(renamed)
    }

    /// Delete a layer of the active document.
    pub fn delete_layer(&self, id: i64) -> Result<(), HostError> {
        let mut inner = self.lock();
        let doc = inner.active_doc_mut()?;
        let before = doc.layers.len();
        doc.layers.retain(|l| l.id != id);
        if doc.layers.len() == before {
            return Err(HostError::Message(format!("no layer with id {id}")));
        }
        if doc.active_layer == Some(id) {
            doc.active_layer = doc.layers.last().map(|l| l.id);
        }
        inner.push_state("Delete Layer");
        Ok(())
    }

    /// Make a layer of the active document the targeted one.
    pub fn select_layer(&self, id: i64) -> Result<LayerInfo, HostError> {
        let mut inner = self.lock();
        let doc = inner.active_doc_mut()?;
        let layer = doc
            .layers
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or(HostError::Message(format!("no layer with id {id}")))?;
        doc.active_layer = Some(id);
        Ok(layer)
    }

    // -- Test knobs ------------------------------------------------------

    /// Make the next `n` modal entries fail with [`HostError::ModalBusy`].
    pub fn refuse_modal_entries(&self, n: u32) {
        self.lock().busy_refusals = n;
    }

    /// Drop the whole history state list, as a host that prunes would.
    pub fn prune_states(&self) {
        let mut inner = self.lock();
        inner.states.clear();
        inner.current_state = None;
    }

    /// Forget a named snapshot.
    pub fn drop_snapshot(&self, name: &str) {
        self.lock().snapshots.remove(name);
    }

    /// Structural digest of all documents, for state-preservation checks.
    pub fn fingerprint(&self) -> Value {
        let inner = self.lock();
        serde_json::json!({
            "docs": serde_json::to_value(&inner.docs).unwrap_or(Value::Null),
            "active": inner.active,
        })
    }
}

#[async_trait]
impl HostBridge for MemoryHost {
    fn active_document(&self) -> Option<DocumentInfo> {
        let inner = self.lock();
        inner.active.and_then(|i| inner.docs.get(i)).map(|d| d.info.clone())
    }

    fn documents(&self) -> Vec<DocumentInfo> {
        self.lock().docs.iter().map(|d| d.info.clone()).collect()
    }

    fn layers(&self) -> Vec<LayerInfo> {
        let inner = self.lock();
        inner
            .active
            .and_then(|i| inner.docs.get(i))
            .map(|d| d.layers.clone())
            .unwrap_or_default()
    }

    fn active_layer(&self) -> Option<LayerInfo> {
        let inner = self.lock();
        let doc = inner.active.and_then(|i| inner.docs.get(i))?;
        let id = doc.active_layer?;
        doc.layers.iter().find(|l| l.id == id).cloned()
    }

    async fn begin_modal(&self, _command_name: &str) -> Result<(), HostError> {
        let mut inner = self.lock();
        if inner.busy_refusals > 0 {
            inner.busy_refusals -= 1;
            return Err(HostError::ModalBusy { detail: "host dialog open".into() });
        }
        if inner.modal_held {
            return Err(HostError::ModalBusy { detail: "modal scope already held".into() });
        }
        inner.modal_held = true;
        Ok(())
    }

    async fn end_modal(&self) {
        self.lock().modal_held = false;
    }

    fn current_state_id(&self) -> Option<i64> {
        self.lock().current_state
    }

    fn list_states(&self) -> Vec<StateEntry> {
        self.lock().states.iter().map(|s| s.entry.clone()).collect()
    }

    async fn create_snapshot(&self, name: &str) -> Result<(), HostError> {
        let mut inner = self.lock();
        if inner.docs.is_empty() {
            return Err(HostError::Snapshot("no document to snapshot".into()));
        }
        inner.next_state_id += 1;
        let saved = Saved {
            entry: StateEntry { id: inner.next_state_id, name: name.to_string() },
            docs: inner.docs.clone(),
            active: inner.active,
        };
        inner.snapshots.insert(name.to_string(), saved);
        Ok(())
    }

    async fn select_snapshot(&self, name: &str) -> Result<(), HostError> {
        let mut inner = self.lock();
        let saved = inner
            .snapshots
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::Snapshot(format!("no snapshot named \"{name}\"")))?;
        inner.restore(&saved);
        Ok(())
    }

    async fn select_state(&self, id: i64) -> Result<(), HostError> {
        let mut inner = self.lock();
        let saved = inner
            .states
            .iter()
            .find(|s| s.entry.id == id)
            .cloned()
            .ok_or(HostError::StateNotFound { id })?;
        inner.restore(&saved);
        Ok(())
    }
}
