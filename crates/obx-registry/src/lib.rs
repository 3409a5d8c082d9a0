// SPDX-License-Identifier: MIT OR Apache-2.0
//! Op catalog for the opbatch executor.
//!
//! Canonicalizes op names through a case- and punctuation-insensitive
//! alias table, carries the per-op preflight data (required-field matrix,
//! active-document and layer-target flags), and holds the registry of leaf
//! handlers keyed by primary name.
//!
//! The catalog is a data table: adding an op or an alias touches
//! [`CATALOG`], never control flow.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use futures::future::BoxFuture;
use obx_core::RefKind;
use obx_error::{ErrorCode, ExecError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Canonical keys
// ---------------------------------------------------------------------------

/// Canonical lookup key for an op name: lower-case, all non-alphanumeric
/// characters removed.
///
/// # Examples
///
/// ```
/// assert_eq!(obx_registry::canonical_key("Layer.Create"), "layercreate");
/// assert_eq!(obx_registry::canonical_key("LAYER-DELETE"), "layerdelete");
/// ```
pub fn canonical_key(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Op specs
// ---------------------------------------------------------------------------

/// Static description of one first-class op.
#[derive(Debug, Clone, Copy)]
pub struct OpSpec {
    /// Primary registered name.
    pub primary: &'static str,

    /// Alternate spellings registered alongside the primary.
    pub aliases: &'static [&'static str],

    /// Required-field matrix: every group must be satisfied, a group is
    /// satisfied when any one of its fields holds a meaningful value.
    pub required: &'static [&'static [&'static str]],

    /// Whether preflight demands an active document.  Document creators
    /// and openers are the only ops that run without one.
    pub needs_document: bool,

    /// Whether preflight must resolve a target layer before dispatch.
    pub needs_layer_target: bool,

    /// What kind of ref value the op conjures, driving dry-run
    /// placeholders.
    pub creates: Option<RefKind>,
}

/// The binding op table.  Preflight and dry-run behavior read from here;
/// handlers are registered separately under the primary names.
pub const CATALOG: &[OpSpec] = &[
    OpSpec {
        primary: "createDocument",
        aliases: &["newDocument", "documentCreate"],
        required: &[],
        needs_document: false,
        needs_layer_target: false,
        creates: Some(RefKind::Document),
    },
    OpSpec {
        primary: "openDocument",
        aliases: &["documentOpen", "open"],
        required: &[&["input", "path", "source"]],
        needs_document: false,
        needs_layer_target: false,
        creates: Some(RefKind::Document),
    },
    OpSpec {
        primary: "closeDocument",
        aliases: &["documentClose"],
        required: &[],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
    OpSpec {
        primary: "saveDocument",
        aliases: &["documentSave", "save"],
        required: &[],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
    OpSpec {
        primary: "exportDocument",
        aliases: &["documentExport", "export"],
        required: &[&["output"]],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
    OpSpec {
        primary: "exportLayersByName",
        aliases: &["exportByName"],
        required: &[&["match"], &["outputDir", "output"]],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
    OpSpec {
        primary: "createLayer",
        aliases: &["layerCreate", "newLayer"],
        required: &[],
        needs_document: true,
        needs_layer_target: false,
        creates: Some(RefKind::Layer),
    },
    OpSpec {
        primary: "duplicateLayer",
        aliases: &["layerDuplicate"],
        required: &[],
        needs_document: true,
        needs_layer_target: true,
        creates: Some(RefKind::Layer),
    },
    OpSpec {
        primary: "deleteLayer",
        aliases: &["layerDelete", "removeLayer"],
        required: &[],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "renameLayer",
        aliases: &["layerRename"],
        required: &[&["newName", "name"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "moveLayer",
        aliases: &["layerMove", "reorderLayer"],
        required: &[],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "selectLayer",
        aliases: &["layerSelect"],
        required: &[],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "setLayerOpacity",
        aliases: &["layerOpacity", "opacity"],
        required: &[&["opacity"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "setLayerVisibility",
        aliases: &["layerVisibility", "showLayer", "hideLayer"],
        required: &[&["visible"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "createTextLayer",
        aliases: &["textLayerCreate", "addText"],
        required: &[&["text", "contents"]],
        needs_document: true,
        needs_layer_target: false,
        creates: Some(RefKind::Layer),
    },
    OpSpec {
        primary: "setText",
        aliases: &["textSet", "editText"],
        required: &[&["text", "contents"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "placeAsset",
        aliases: &["place", "placeImage"],
        required: &[&["input", "path", "source"]],
        needs_document: true,
        needs_layer_target: false,
        creates: Some(RefKind::Layer),
    },
    OpSpec {
        primary: "replaceSmartObject",
        aliases: &["smartObjectReplace"],
        required: &[&["input", "path", "source"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "relinkSmartObject",
        aliases: &["smartObjectRelink"],
        required: &[&["input", "path", "source"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "applyFilter",
        aliases: &["filter", "runFilter"],
        required: &[&["filter", "name"]],
        needs_document: true,
        needs_layer_target: true,
        creates: None,
    },
    OpSpec {
        primary: "batchPlay",
        aliases: &["actionDescriptor", "playAction"],
        required: &[&["commands", "command", "descriptor"]],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
    OpSpec {
        primary: "flattenImage",
        aliases: &["flatten"],
        required: &[],
        needs_document: true,
        needs_layer_target: false,
        creates: None,
    },
];

/// `true` when a field value satisfies a required-field group: non-empty
/// string, non-empty array, or any non-null scalar/object.
pub fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Bool(_) | Value::Number(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

/// Case/punctuation-insensitive lookup from any accepted spelling to its
/// [`OpSpec`].
#[derive(Debug, Clone)]
pub struct OpCatalog {
    by_key: BTreeMap<String, &'static OpSpec>,
}

impl Default for OpCatalog {
    fn default() -> Self {
        let mut by_key = BTreeMap::new();
        for spec in CATALOG {
            by_key.insert(canonical_key(spec.primary), spec);
            for alias in spec.aliases {
                by_key.insert(canonical_key(alias), spec);
            }
        }
        Self { by_key }
    }
}

impl OpCatalog {
    /// Resolve a raw op name to its spec.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::UnknownOp`] when no registered name matches.
    pub fn lookup(&self, op: &str) -> Result<&'static OpSpec, ExecError> {
        self.by_key.get(&canonical_key(op)).copied().ok_or_else(|| {
            ExecError::new(ErrorCode::UnknownOp, format!("unknown op \"{op}\""))
                .with_context("op", op)
        })
    }

    /// All primary names, sorted.
    pub fn primary_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = CATALOG.iter().map(|s| s.primary).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// An op after ref resolution and canonicalization, as handlers see it.
#[derive(Debug, Clone)]
pub struct ResolvedOp {
    /// The canonical (primary) op name.
    pub canonical: &'static str,
    /// The raw name as submitted.
    pub raw: String,
    /// The ref-resolved payload, already deep-cloned; handlers may
    /// mutate it freely.
    pub payload: Map<String, Value>,
}

impl ResolvedOp {
    /// A payload field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Read-only execution context passed to every handler invocation.
///
/// `refs` is a snapshot of the environment as of this op's dispatch;
/// handlers never touch the live environment.
#[derive(Debug, Clone)]
pub struct HandlerCtx {
    /// Snapshot of the batch's ref environment.
    pub refs: BTreeMap<String, Value>,
    /// Position of the op in the batch.
    pub index: usize,
    /// The batch's transaction id.
    pub tx: String,
}

/// A leaf handler: wraps exactly one host API behind the executor.
///
/// The returned JSON may carry `refValue` (preferred binding), `layer`,
/// `document`, `detail`, and arbitrary handler-specific fields.
/// `Value::Null` is permitted and reported as `Executed '<op>'`; any other
/// non-object return is a contract violation surfaced as
/// [`ErrorCode::HandlerContract`].
pub trait Handler: Send + Sync {
    /// Execute the op against the host. Runs inside the modal gate.
    fn call(&self, op: ResolvedOp, ctx: HandlerCtx) -> BoxFuture<'static, Result<Value, ExecError>>;
}

/// Wrap an async closure as a [`Handler`].
///
/// # Examples
///
/// ```
/// use obx_registry::{HandlerRegistry, handler_fn};
/// use serde_json::json;
///
/// let mut registry = HandlerRegistry::default();
/// registry.register(
///     "createLayer",
///     handler_fn(|op, _ctx| async move {
///         Ok(json!({ "detail": format!("Executed '{}'", op.raw) }))
///     }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> impl Handler
where
    F: Fn(ResolvedOp, HandlerCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    impl<F, Fut> Handler for FnHandler<F>
    where
        F: Fn(ResolvedOp, HandlerCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        fn call(
            &self,
            op: ResolvedOp,
            ctx: HandlerCtx,
        ) -> BoxFuture<'static, Result<Value, ExecError>> {
            Box::pin((self.0)(op, ctx))
        }
    }

    FnHandler(f)
}

/// Typed registry of leaf handlers keyed by primary op name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Register a handler under a primary name, replacing any previous one.
    pub fn register(&mut self, primary: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(primary.into(), Arc::new(handler));
    }

    /// Look up a handler by primary name.
    pub fn get(&self, primary: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(primary).cloned()
    }

    /// Check whether a handler is registered for the given primary name.
    pub fn contains(&self, primary: &str) -> bool {
        self.handlers.contains_key(primary)
    }

    /// Sorted list of registered primary names.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.list())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
