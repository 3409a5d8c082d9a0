// SPDX-License-Identifier: MIT OR Apache-2.0
//! obx-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the opbatch executor.
//!
//! Everything that crosses the executor boundary lives here: the incoming
//! batch envelope, the duck-typed operation payload, the per-op and
//! per-batch result shapes, checkpoints, and the capability block the
//! executor always advertises.  Wire casing is camelCase throughout.

/// Structural validation of incoming batch envelopes.
pub mod envelope;

use obx_error::ErrorReport;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Ref-token syntax advertised in the capability block.
pub const REF_SYNTAX: &str = "$name and $name.path";

/// Rollback strategy string advertised in the capability block.
pub const ROLLBACK_STRATEGY: &str = "snapshot+statePointer";

/// Fields that assign an op's result to a named ref, in first-wins order.
///
/// At most one of these is consumed per op; the first present (in this
/// exact order) wins and the rest are ignored.
pub const REF_ASSIGN_FIELDS: &[&str] = &["ref", "refId", "as", "outputRef", "storeAs", "idRef"];

/// Fields whose string values are always literal text, never ref tokens.
pub const LITERAL_TEXT_FIELDS: &[&str] = &["text", "contents"];

/// Upper bound for the `safety.opDelayMs` pacing knob, in milliseconds.
pub const MAX_OP_DELAY_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Ref names
// ---------------------------------------------------------------------------

/// Returns `true` when `name` satisfies the ref-name grammar
/// `[A-Za-z_][A-Za-z0-9_-]*`.
///
/// # Examples
///
/// ```
/// assert!(obx_core::is_valid_ref_name("layerA"));
/// assert!(obx_core::is_valid_ref_name("_tmp-1"));
/// assert!(!obx_core::is_valid_ref_name("1layer"));
/// assert!(!obx_core::is_valid_ref_name(""));
/// ```
pub fn is_valid_ref_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A validated batch of operations against one host document.
///
/// Produced by [`envelope::parse_envelope`]; never constructed from
/// unchecked input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    /// Caller-chosen identifier echoed into the [`BatchResult`].
    pub transaction_id: String,

    /// The document the batch targets.
    pub doc: DocTarget,

    /// Pre-seeded ref environment entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub refs: BTreeMap<String, Value>,

    /// Ordered, non-empty sequence of operations.
    pub ops: Vec<Operation>,

    /// Safety knobs: dry-run, checkpointing, error policy, pacing.
    #[serde(default)]
    pub safety: SafetyOptions,
}

/// The document a batch targets. `"active"` means the host's current one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DocTarget {
    /// Document reference: `"active"`, an id, or a title.
    #[serde(rename = "ref")]
    pub doc_ref: String,
}

/// Safety knobs accepted under the envelope's `safety` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SafetyOptions {
    /// Validate and resolve only; never enter the modal gate.
    #[serde(default)]
    pub dry_run: bool,

    /// Capture a pre-batch checkpoint even when rollback is not requested.
    #[serde(default)]
    pub checkpoint: bool,

    /// Capture a checkpoint and restore it if any op fails.
    #[serde(default)]
    pub rollback_on_error: bool,

    /// Batch-wide default error policy. Overrides `continueOnError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorPolicy>,

    /// Legacy truthy alias for `onError: "continue"`.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Pause between ops, in milliseconds. Pacing for demos and
    /// rate-limited hosts; never applied after the last op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_delay_ms: Option<u64>,
}

/// What happens to the rest of the batch when an op fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorPolicy {
    /// Stop executing; no later op runs or emits a result.
    Abort,
    /// Record the failure and keep going.
    Continue,
}

impl OnErrorPolicy {
    /// Case-insensitive parse of the wire strings `"abort"` / `"continue"`.
    pub fn parse_ci(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("abort") {
            Some(Self::Abort)
        } else if s.eq_ignore_ascii_case("continue") {
            Some(Self::Continue)
        } else {
            None
        }
    }
}

impl fmt::Display for OnErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
        })
    }
}

// ---------------------------------------------------------------------------
// Ref values
// ---------------------------------------------------------------------------

/// The tagged ref-value kinds the executor recognizes.
///
/// Handlers typically bind layer-kind or document-kind objects; anything
/// else is allowed and classified as [`RefKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// `{ "kind": "layer", layerId, layerName, id, name }`.
    Layer,
    /// `{ "kind": "document", docId, title, ref: "active" }`.
    Document,
    /// Any other JSON-serializable shape.
    Other,
}

impl RefKind {
    /// Classify a ref value by its `kind` tag.
    pub fn of(value: &Value) -> Self {
        match value.get("kind").and_then(Value::as_str) {
            Some("layer") => Self::Layer,
            Some("document") => Self::Document,
            _ => Self::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One imperative operation: a duck-typed JSON object whose `op` field
/// names the action (possibly via alias).
///
/// The payload is kept verbatim; leaf handlers own the interpretation of
/// everything beyond `op`, `onError`, and the ref-assignment fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation {
    /// The raw payload object.
    pub payload: Map<String, Value>,
}

impl Operation {
    /// The raw (pre-canonicalization) op name.
    ///
    /// Validation guarantees this is a non-empty string; an empty return
    /// here means the operation was constructed outside the validator.
    pub fn name(&self) -> &str {
        self.payload.get("op").and_then(Value::as_str).unwrap_or("")
    }

    /// The per-op error policy, if one is declared.
    pub fn on_error(&self) -> Option<OnErrorPolicy> {
        self.payload
            .get("onError")
            .and_then(Value::as_str)
            .and_then(OnErrorPolicy::parse_ci)
    }

    /// The ref name this op assigns its result to, if any.
    ///
    /// Walks [`REF_ASSIGN_FIELDS`] in order; the first field holding a
    /// string wins.
    pub fn ref_assignment(&self) -> Option<&str> {
        REF_ASSIGN_FIELDS
            .iter()
            .find_map(|f| self.payload.get(*f).and_then(Value::as_str))
    }

    /// A payload field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

// ---------------------------------------------------------------------------
// Op results
// ---------------------------------------------------------------------------

/// Fate of a single op slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// The handler ran and succeeded.
    Applied,
    /// The op failed (resolution, preflight, host, or handler).
    Failed,
    /// Dry-run: the op passed validation, resolution, and preflight.
    Validated,
    /// Reserved for embedders that pre-filter ops; the runner itself
    /// stops emitting entries after an abort instead.
    Skipped,
}

/// The structured outcome of one op slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    /// Position of the op in the envelope's `ops` list.
    pub index: usize,

    /// The raw op name as submitted.
    pub op: String,

    /// The canonical name, when alias lookup succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_op: Option<String>,

    /// The error policy that was in effect for this op.
    pub on_error: OnErrorPolicy,

    /// What happened.
    pub status: OpStatus,

    /// Wall-clock duration of this op slot, in milliseconds.
    pub duration_ms: u64,

    /// The ref name bound by this op, when one was assigned and bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_assigned: Option<String>,

    /// Handler result payload, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Normalized error, present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

// ---------------------------------------------------------------------------
// Checkpoints & rollback
// ---------------------------------------------------------------------------

/// Which pre-batch capture strategy a checkpoint ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CheckpointStrategy {
    /// A named full-document snapshot exists in the host.
    #[serde(rename = "snapshot")]
    Snapshot,
    /// Only the host's history state pointer was recorded.
    #[serde(rename = "statePointer")]
    StatePointer,
    /// Nothing restorable could be captured.
    #[serde(rename = "none")]
    None,
}

impl fmt::Display for CheckpointStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot",
            Self::StatePointer => "statePointer",
            Self::None => "none",
        })
    }
}

/// The only rollback behavior this executor ever promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum RollbackBehavior {
    /// Restoration may fail or be lossy; the host's fidelity is the cap.
    #[default]
    #[serde(rename = "best-effort")]
    BestEffort,
}

/// A process-local handle to pre-batch state, usable for best-effort restore.
///
/// Checkpoints outlive the batch that created them and are retained until
/// explicitly discarded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub id: Uuid,

    /// When the checkpoint was captured.
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Optional caller-supplied label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// The strongest capture strategy that succeeded.
    pub strategy: CheckpointStrategy,

    /// Whether any restorable anchor was captured.
    pub restore_supported: bool,

    /// Always best-effort; the host cannot offer ACID.
    pub behavior: RollbackBehavior,

    /// Name of the host snapshot, when one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    /// Host history-state id, when one was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<i64>,

    /// Human-readable capture summary.
    pub detail: String,
}

/// Rollback facts reported in every [`BatchResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSummary {
    /// Whether the envelope asked for rollback-on-error.
    pub requested: bool,

    /// Whether a restorable checkpoint exists for this batch.
    pub supported: bool,

    /// Capture strategy of the batch checkpoint, if one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<CheckpointStrategy>,

    /// Always best-effort.
    pub behavior: RollbackBehavior,

    /// Id of the batch checkpoint, if one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,

    /// Whether restoration was attempted after the batch.
    pub attempted: bool,

    /// Whether the host reported a successful restore.
    pub restored: bool,

    /// Human-readable rollback outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What this executor supports, advertised verbatim in every result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityBlock {
    /// Ops may name values produced by earlier ops in the same batch.
    pub op_local_refs: bool,

    /// The accepted ref-token syntax.
    pub ref_syntax: String,

    /// Each op may carry its own `onError` policy.
    pub per_op_on_error: bool,

    /// Rollback support and its honest limits.
    pub rollback_on_error: RollbackCapability,

    /// Results are structured per-op reports, not a single string.
    pub structured_result: bool,

    /// Failed ops carry normalized, introspectable error records.
    pub handler_error_introspection: bool,
}

/// The rollback leg of the capability block.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCapability {
    /// Rollback-on-error is available.
    pub supported: bool,
    /// The layered capture strategy.
    pub strategy: String,
    /// Always best-effort.
    pub behavior: RollbackBehavior,
}

impl Default for CapabilityBlock {
    fn default() -> Self {
        Self {
            op_local_refs: true,
            ref_syntax: REF_SYNTAX.to_string(),
            per_op_on_error: true,
            rollback_on_error: RollbackCapability {
                supported: true,
                strategy: ROLLBACK_STRATEGY.to_string(),
                behavior: RollbackBehavior::BestEffort,
            },
            structured_result: true,
            handler_error_introspection: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch result
// ---------------------------------------------------------------------------

/// The complete, auditable outcome of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Echo of the envelope's transaction id.
    pub transaction_id: String,

    /// Whether the batch ran in dry-run mode.
    pub dry_run: bool,

    /// Number of ops with status `applied` (or `validated` in dry-run).
    pub applied: u32,

    /// Number of ops with status `failed`.
    pub failed: u32,

    /// Whether the batch stopped early under an abort policy.
    pub aborted: bool,

    /// Id of the pre-batch checkpoint, if one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,

    /// Rollback request, capability, and outcome facts.
    pub rollback: RollbackSummary,

    /// Final ref environment snapshot, deep-cloned.
    pub refs: BTreeMap<String, Value>,

    /// Ordered per-op outcomes; omitted indices form a contiguous suffix
    /// and only occur after an abort.
    pub op_results: Vec<OpResult>,

    /// The universal capability block.
    pub capabilities: CapabilityBlock,

    /// Single-line human summary.
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_name_grammar() {
        for good in ["a", "Z9", "_x", "layer_A-1", "lastLayer"] {
            assert!(is_valid_ref_name(good), "{good} should be valid");
        }
        for bad in ["", "1a", "-a", "a.b", "a b", "$a", "é"] {
            assert!(!is_valid_ref_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn operation_accessors() {
        let op: Operation = serde_json::from_value(json!({
            "op": "createLayer",
            "onError": "Continue",
            "as": "layerA",
            "name": "A"
        }))
        .unwrap();
        assert_eq!(op.name(), "createLayer");
        assert_eq!(op.on_error(), Some(OnErrorPolicy::Continue));
        assert_eq!(op.ref_assignment(), Some("layerA"));
        assert_eq!(op.field("name"), Some(&json!("A")));
    }

    #[test]
    fn ref_assignment_first_wins() {
        let op: Operation = serde_json::from_value(json!({
            "op": "createLayer",
            "storeAs": "second",
            "refId": "first"
        }))
        .unwrap();
        // "refId" precedes "storeAs" in the fixed consumption order,
        // regardless of JSON key order.
        assert_eq!(op.ref_assignment(), Some("first"));
    }

    #[test]
    fn capability_block_is_the_universal_one() {
        let caps = CapabilityBlock::default();
        let v = serde_json::to_value(&caps).unwrap();
        assert_eq!(
            v,
            json!({
                "opLocalRefs": true,
                "refSyntax": "$name and $name.path",
                "perOpOnError": true,
                "rollbackOnError": {
                    "supported": true,
                    "strategy": "snapshot+statePointer",
                    "behavior": "best-effort"
                },
                "structuredResult": true,
                "handlerErrorIntrospection": true
            })
        );
    }

    #[test]
    fn checkpoint_strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&CheckpointStrategy::StatePointer).unwrap(),
            r#""statePointer""#
        );
        assert_eq!(
            serde_json::to_string(&CheckpointStrategy::Snapshot).unwrap(),
            r#""snapshot""#
        );
        assert_eq!(
            serde_json::to_string(&CheckpointStrategy::None).unwrap(),
            r#""none""#
        );
    }

    #[test]
    fn op_result_serializes_camel_case() {
        let r = OpResult {
            index: 2,
            op: "Layer.Create".into(),
            canonical_op: Some("createLayer".into()),
            on_error: OnErrorPolicy::Abort,
            status: OpStatus::Applied,
            duration_ms: 12,
            ref_assigned: Some("layerA".into()),
            result: None,
            error: None,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["canonicalOp"], json!("createLayer"));
        assert_eq!(v["onError"], json!("abort"));
        assert_eq!(v["durationMs"], json!(12));
        assert_eq!(v["refAssigned"], json!("layerA"));
        assert_eq!(v["status"], json!("applied"));
        assert!(v.get("error").is_none());
    }
}
