// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host abstraction for the opbatch executor.
//!
//! The executor never talks to a host application directly; it goes through
//! [`HostBridge`], which exposes the handful of primitives the core needs:
//! the active-document query, the flattened layer list, the cooperative
//! modal gate, and the snapshot/state facilities that back checkpoints.
//!
//! [`MemoryHost`] is a deterministic in-memory implementation used by the
//! executor's own test suite and by embedders for local development.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Deterministic in-memory host.
pub mod memory;
/// Layer and document target resolution.
pub mod target;

pub use memory::MemoryHost;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A document known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    /// Host-assigned document id.
    pub id: i64,
    /// Document title.
    pub title: String,
}

/// One entry of a document's flattened layer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    /// Host-assigned layer id.
    pub id: i64,
    /// Layer name.
    pub name: String,
}

/// One entry of the host's history state list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    /// Host-assigned state id.
    pub id: i64,
    /// State label.
    pub name: String,
}

/// The layer-kind tagged ref value for a layer.
pub fn layer_ref_value(layer: &LayerInfo) -> Value {
    json!({
        "kind": "layer",
        "layerId": layer.id,
        "layerName": layer.name,
        "id": layer.id,
        "name": layer.name,
    })
}

/// The document-kind tagged ref value for a document.
pub fn document_ref_value(doc: &DocumentInfo) -> Value {
    json!({
        "kind": "document",
        "docId": doc.id,
        "title": doc.title,
        "ref": "active",
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The host error vocabulary the executor knows how to normalize.
///
/// Adapters for real hosts that only surface stringly errors can wrap them
/// in [`HostError::Message`]; normalization also scans message text for the
/// recognizable phrases.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The modal gate is occupied (the host is mid-dialog / transform /
    /// edit). Eligible for bounded retry.
    #[error("host modal state is busy: {detail}")]
    ModalBusy {
        /// What the host reported.
        detail: String,
    },

    /// The host reports the command as not currently available.
    #[error("command \"{command}\" is not currently available")]
    CommandUnavailable {
        /// The host command name.
        command: String,
    },

    /// The host raised a program error while executing the command.
    #[error("program error while executing \"{command}\"")]
    ProgramError {
        /// The host command name.
        command: String,
    },

    /// The target is not a valid document.
    #[error("target is not a valid document")]
    InvalidDocument,

    /// A snapshot or state operation failed.
    #[error("snapshot/state failure: {0}")]
    Snapshot(String),

    /// A history state id is no longer present in the host's state list.
    #[error("history state {id} not found")]
    StateNotFound {
        /// The missing state id.
        id: i64,
    },

    /// Verbatim host error text from an adapter.
    #[error("{0}")]
    Message(String),
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// The host boundary consumed by the executor core.
///
/// Accessors are synchronous (the host exposes them as cheap property
/// reads); everything that can block or mutate is async.  Only code that
/// has entered the modal gate may mutate the document; the executor's
/// modal coordinator enforces its side of that contract, the host enforces
/// the rest.
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// The currently active document, if any.
    fn active_document(&self) -> Option<DocumentInfo>;

    /// All open documents.
    fn documents(&self) -> Vec<DocumentInfo>;

    /// The flattened layer list of the active document.
    fn layers(&self) -> Vec<LayerInfo>;

    /// The currently targeted layer of the active document, if any.
    fn active_layer(&self) -> Option<LayerInfo>;

    /// Enter the host's cooperative modal scope.
    ///
    /// # Errors
    ///
    /// [`HostError::ModalBusy`] when the host is mid-dialog; other
    /// vocabulary errors for terminal conditions.
    async fn begin_modal(&self, command_name: &str) -> Result<(), HostError>;

    /// Leave the modal scope. Idempotent.
    async fn end_modal(&self);

    /// The host's current history state pointer, if the host keeps one.
    fn current_state_id(&self) -> Option<i64>;

    /// The host's history state list, oldest first.
    fn list_states(&self) -> Vec<StateEntry>;

    /// Create a named full-document snapshot.
    async fn create_snapshot(&self, name: &str) -> Result<(), HostError>;

    /// Make the named snapshot the active state.
    async fn select_snapshot(&self, name: &str) -> Result<(), HostError>;

    /// Make the history state with the given id active.
    async fn select_state(&self, id: i64) -> Result<(), HostError>;
}
