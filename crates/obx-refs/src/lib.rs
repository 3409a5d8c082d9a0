// SPDX-License-Identifier: MIT OR Apache-2.0
//! Symbolic ref environment for the opbatch executor.
//!
//! Ops in a batch can name values produced by earlier ops.  This crate owns
//! the per-batch environment: `$name` / `$name.path` token parsing, the
//! eager resolution walk over op payloads, and the bind rules that store a
//! successful op's result under an assigned name plus the automatic refs
//! `last`, `lastLayer`, and `lastDocument`.
//!
//! The environment is append-or-overwrite only for the life of a batch;
//! both resolve and bind deep-clone so handler mutation can never bleed
//! back into stored values.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use obx_core::{LITERAL_TEXT_FIELDS, REF_ASSIGN_FIELDS, RefKind};
use obx_error::{ErrorCode, ExecError};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Automatic ref updated after every successful op that bound a value.
pub const AUTO_LAST: &str = "last";
/// Automatic ref tracking the most recent layer-kind binding.
pub const AUTO_LAST_LAYER: &str = "lastLayer";
/// Automatic ref tracking the most recent document-kind binding.
pub const AUTO_LAST_DOCUMENT: &str = "lastDocument";

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// A parsed `$name` or `$name.path.segment` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefToken<'a> {
    /// The full token text, `$` included.
    pub raw: &'a str,
    /// The ref name (first dot-separated segment).
    pub name: &'a str,
    /// Remaining dot-separated path segments.
    pub path: Vec<&'a str>,
}

impl RefToken<'_> {
    /// `true` when the token is a bare `$name` with no path.
    pub fn is_bare(&self) -> bool {
        self.path.is_empty()
    }
}

/// Parse a candidate string as a ref token.
///
/// Returns `None` when the string is not token-shaped at all (no leading
/// `$`, or a character outside `[A-Za-z0-9_.-]`); such strings are plain
/// literals and resolution leaves them untouched.
pub fn parse_token(s: &str) -> Option<RefToken<'_>> {
    let body = s.strip_prefix('$')?;
    if body.is_empty() {
        return None;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return None;
    }
    let mut segments = body.split('.');
    let name = segments.next().unwrap_or("");
    Some(RefToken {
        raw: s,
        name,
        path: segments.collect(),
    })
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The per-batch ref environment.
///
/// Created empty (or seeded from the envelope) at batch start and discarded
/// at batch end.  Owned exclusively by the batch runner; handlers only ever
/// see resolved clones.
#[derive(Debug, Clone, Default)]
pub struct RefEnv {
    entries: BTreeMap<String, Value>,
}

impl RefEnv {
    /// Create an environment pre-seeded from the envelope's `refs` map.
    pub fn seeded(seed: BTreeMap<String, Value>) -> Self {
        Self { entries: seed }
    }

    /// Look up a stored value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Store a value under `name`, overwriting any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    /// Deep-cloned snapshot of the whole environment.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }

    // -- Resolution (read) ----------------------------------------------

    /// Resolve every ref token in an op payload, returning a deep clone.
    ///
    /// Skip rules: the top-level `op`, `onError`, and ref-assignment
    /// fields are never tokens; the literal-text fields (`text`,
    /// `contents`) are skipped at any depth.  A bare unknown `$name` at a
    /// top-level string position stays literal; any other unresolvable
    /// token fails the op.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::UnknownRef`] naming the token that failed.
    pub fn resolve_op(&self, payload: &Map<String, Value>) -> Result<Map<String, Value>, ExecError> {
        let mut out = Map::with_capacity(payload.len());
        for (key, value) in payload {
            let skip = key == "op"
                || key == "onError"
                || REF_ASSIGN_FIELDS.contains(&key.as_str())
                || LITERAL_TEXT_FIELDS.contains(&key.as_str());
            let resolved = if skip {
                value.clone()
            } else {
                self.resolve_value(value, true)?
            };
            out.insert(key.clone(), resolved);
        }
        Ok(out)
    }

    fn resolve_value(&self, value: &Value, top_level: bool) -> Result<Value, ExecError> {
        match value {
            Value::String(s) => self.resolve_string(s, top_level),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_value(item, false)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, v) in fields {
                    let resolved = if LITERAL_TEXT_FIELDS.contains(&key.as_str()) {
                        v.clone()
                    } else {
                        self.resolve_value(v, false)?
                    };
                    out.insert(key.clone(), resolved);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, s: &str, top_level: bool) -> Result<Value, ExecError> {
        let Some(token) = parse_token(s) else {
            return Ok(Value::String(s.to_string()));
        };
        match self.resolve_token(&token) {
            Ok(v) => Ok(v),
            // Top-level bare tokens with an unknown name are plain text:
            // agents routinely embed non-ref strings there.
            Err(_) if top_level && token.is_bare() && self.get(token.name).is_none() => {
                Ok(Value::String(s.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a parsed token against the environment.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::UnknownRef`] when the name is unknown or a path
    /// segment is missing.
    pub fn resolve_token(&self, token: &RefToken<'_>) -> Result<Value, ExecError> {
        let mut cursor = self.get(token.name).ok_or_else(|| {
            ExecError::new(ErrorCode::UnknownRef, format!("unknown ref \"{}\"", token.raw))
                .with_context("token", token.raw)
        })?;
        for segment in &token.path {
            let next = match cursor {
                Value::Object(map) => map.get(*segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            cursor = next.ok_or_else(|| {
                ExecError::new(
                    ErrorCode::UnknownRef,
                    format!("unknown ref \"{}\": no segment \"{segment}\"", token.raw),
                )
                .with_context("token", token.raw)
                .with_context("segment", *segment)
            })?;
        }
        Ok(cursor.clone())
    }

    // -- Binding (write) ------------------------------------------------

    /// Bind a successful op's result into the environment.
    ///
    /// The bound value is the handler's `refValue` verbatim when present,
    /// else its `layer` or `document` object.  Stores under `assign` when
    /// the op carried a ref-assignment field, and always refreshes the
    /// automatic refs.  Returns the name actually bound, if any.
    pub fn bind_result(&mut self, assign: Option<&str>, result: Option<&Value>) -> Option<String> {
        let (value, kind) = bound_value(result)?;
        if let Some(name) = assign {
            self.insert(name, value.clone());
        }
        self.insert(AUTO_LAST, value.clone());
        match kind {
            RefKind::Layer => self.insert(AUTO_LAST_LAYER, value),
            RefKind::Document => self.insert(AUTO_LAST_DOCUMENT, value),
            RefKind::Other => {}
        }
        assign.map(String::from)
    }
}

/// Extract the bindable value from a handler result, with its kind.
///
/// `None` when the handler returned nothing bindable; in that case no ref
/// is bound and no automatic ref moves (pure side-effect ops).
pub fn bound_value(result: Option<&Value>) -> Option<(Value, RefKind)> {
    let obj = result?.as_object()?;
    let value = obj
        .get("refValue")
        .or_else(|| obj.get("layer"))
        .or_else(|| obj.get("document"))?;
    Some((value.clone(), RefKind::of(value)))
}

// ---------------------------------------------------------------------------
// Dry-run placeholders
// ---------------------------------------------------------------------------

/// Synthesize the placeholder bound for a ref assignment in dry-run.
///
/// Layer-creating ops get the layer-kind placeholder, document creators a
/// document-kind one, and everything else a neutral marker naming the
/// canonical `op`.  `label` is the op's `name` (or `title`) field when
/// present.
pub fn dry_run_placeholder(
    index: usize,
    op: &str,
    creates: Option<RefKind>,
    label: Option<&str>,
) -> Value {
    let id = format!("dry-{index}");
    match creates {
        Some(RefKind::Layer) => {
            let name = label.unwrap_or(&id);
            json!({
                "kind": "layer",
                "layerId": id,
                "layerName": name,
                "id": id,
                "name": name,
            })
        }
        Some(RefKind::Document) => {
            let title = label.unwrap_or(&id);
            json!({
                "kind": "document",
                "docId": id,
                "title": title,
                "ref": "active",
            })
        }
        _ => json!({ "kind": "placeholder", "id": id, "op": op }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_with(pairs: &[(&str, Value)]) -> RefEnv {
        let mut env = RefEnv::default();
        for (k, v) in pairs {
            env.insert(*k, v.clone());
        }
        env
    }

    fn as_map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    // -- Token parsing ---------------------------------------------------

    #[test]
    fn parses_bare_and_pathed_tokens() {
        let t = parse_token("$layerA").unwrap();
        assert_eq!(t.name, "layerA");
        assert!(t.is_bare());

        let t = parse_token("$layerA.bounds.x").unwrap();
        assert_eq!(t.name, "layerA");
        assert_eq!(t.path, vec!["bounds", "x"]);
    }

    #[test]
    fn rejects_non_token_strings() {
        for s in ["layerA", "$", "$la yer", "$la/yer", "", "money: $50?no"] {
            assert!(parse_token(s).is_none(), "{s:?} should not parse");
        }
        // "$?" is the canonical malformed target: not token-shaped.
        assert!(parse_token("$?").is_none());
    }

    // -- Resolution ------------------------------------------------------

    #[test]
    fn resolves_top_level_token() {
        let env = env_with(&[("layerA", json!({ "kind": "layer", "layerId": 3 }))]);
        let resolved = env
            .resolve_op(&as_map(json!({ "op": "renameLayer", "target": "$layerA" })))
            .unwrap();
        assert_eq!(resolved["target"]["layerId"], json!(3));
    }

    #[test]
    fn resolves_nested_tokens_and_paths() {
        let env = env_with(&[("layerA", json!({ "layerId": 3, "bounds": { "x": 10 } }))]);
        let resolved = env
            .resolve_op(&as_map(json!({
                "op": "batchPlay",
                "commands": [{ "x": "$layerA.bounds.x", "id": "$layerA.layerId" }]
            })))
            .unwrap();
        assert_eq!(resolved["commands"][0]["x"], json!(10));
        assert_eq!(resolved["commands"][0]["id"], json!(3));
    }

    #[test]
    fn top_level_unknown_bare_token_stays_literal() {
        let env = RefEnv::default();
        let resolved = env
            .resolve_op(&as_map(json!({ "op": "createLayer", "name": "$brand" })))
            .unwrap();
        assert_eq!(resolved["name"], json!("$brand"));
    }

    #[test]
    fn nested_unknown_token_fails() {
        let env = RefEnv::default();
        let err = env
            .resolve_op(&as_map(json!({ "op": "batchPlay", "commands": ["$missing"] })))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownRef);
        assert!(err.message.contains("$missing"));
    }

    #[test]
    fn pathed_token_with_unknown_base_fails_even_top_level() {
        let env = RefEnv::default();
        let err = env
            .resolve_op(&as_map(json!({ "op": "renameLayer", "target": "$gone.layerId" })))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownRef);
    }

    #[test]
    fn missing_path_segment_fails() {
        let env = env_with(&[("layerA", json!({ "layerId": 3 }))]);
        let err = env
            .resolve_op(&as_map(json!({ "op": "renameLayer", "target": "$layerA.bounds.x" })))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownRef);
        assert!(err.message.contains("bounds"));
    }

    #[test]
    fn path_segments_index_arrays() {
        let env = env_with(&[("sel", json!({ "items": [{ "id": 1 }, { "id": 2 }] }))]);
        let resolved = env
            .resolve_op(&as_map(json!({ "op": "selectLayer", "target": "$sel.items.1.id" })))
            .unwrap();
        assert_eq!(resolved["target"], json!(2));
    }

    #[test]
    fn skip_fields_keep_dollar_literals() {
        let env = env_with(&[("x", json!("resolved"))]);
        let resolved = env
            .resolve_op(&as_map(json!({
                "op": "createTextLayer",
                "as": "x",
                "text": "$x",
                "style": { "contents": "$x" },
                "caption": "$x"
            })))
            .unwrap();
        assert_eq!(resolved["text"], json!("$x"), "text is literal");
        assert_eq!(resolved["style"]["contents"], json!("$x"), "contents is literal at depth");
        assert_eq!(resolved["as"], json!("x"), "ref assignment untouched");
        assert_eq!(resolved["caption"], json!("resolved"));
    }

    #[test]
    fn resolution_does_not_alias_the_environment() {
        let env = env_with(&[("layerA", json!({ "name": "A" }))]);
        let mut resolved = env
            .resolve_op(&as_map(json!({ "op": "renameLayer", "target": "$layerA" })))
            .unwrap();
        resolved["target"]["name"] = json!("mutated");
        assert_eq!(env.get("layerA").unwrap()["name"], json!("A"));
    }

    // -- Binding ---------------------------------------------------------

    #[test]
    fn bind_prefers_ref_value() {
        let mut env = RefEnv::default();
        let result = json!({
            "refValue": { "kind": "layer", "layerId": 9 },
            "layer": { "kind": "layer", "layerId": 1 }
        });
        let bound = env.bind_result(Some("a"), Some(&result));
        assert_eq!(bound.as_deref(), Some("a"));
        assert_eq!(env.get("a").unwrap()["layerId"], json!(9));
        assert_eq!(env.get(AUTO_LAST).unwrap()["layerId"], json!(9));
        assert_eq!(env.get(AUTO_LAST_LAYER).unwrap()["layerId"], json!(9));
        assert!(env.get(AUTO_LAST_DOCUMENT).is_none());
    }

    #[test]
    fn bind_infers_document_kind() {
        let mut env = RefEnv::default();
        let result = json!({ "document": { "kind": "document", "docId": 4 } });
        env.bind_result(None, Some(&result));
        assert_eq!(env.get(AUTO_LAST_DOCUMENT).unwrap()["docId"], json!(4));
        assert!(env.get(AUTO_LAST_LAYER).is_none());
    }

    #[test]
    fn no_bind_on_empty_result() {
        let mut env = RefEnv::default();
        assert!(env.bind_result(Some("a"), None).is_none());
        assert!(env.bind_result(Some("a"), Some(&json!({ "detail": "done" }))).is_none());
        assert!(env.get("a").is_none());
        assert!(env.get(AUTO_LAST).is_none());
    }

    #[test]
    fn last_writer_wins_for_same_name() {
        let mut env = RefEnv::default();
        env.bind_result(Some("x"), Some(&json!({ "refValue": 1 })));
        env.bind_result(Some("x"), Some(&json!({ "refValue": 2 })));
        assert_eq!(env.get("x"), Some(&json!(2)));
    }

    // -- Placeholders ----------------------------------------------------

    #[test]
    fn layer_placeholder_shape() {
        let v = dry_run_placeholder(0, "createLayer", Some(RefKind::Layer), Some("A"));
        assert_eq!(v["kind"], json!("layer"));
        assert_eq!(v["layerId"], json!("dry-0"));
        assert_eq!(v["layerName"], json!("A"));
        assert_eq!(v["id"], json!("dry-0"));
        assert_eq!(v["name"], json!("A"));
    }

    #[test]
    fn document_placeholder_shape() {
        let v = dry_run_placeholder(3, "createDocument", Some(RefKind::Document), None);
        assert_eq!(v["kind"], json!("document"));
        assert_eq!(v["docId"], json!("dry-3"));
        assert_eq!(v["ref"], json!("active"));
    }

    #[test]
    fn neutral_placeholder_shape() {
        let v = dry_run_placeholder(5, "deleteLayer", None, None);
        assert_eq!(
            v,
            json!({ "kind": "placeholder", "id": "dry-5", "op": "deleteLayer" })
        );
    }

    // -- Laws ------------------------------------------------------------

    mod laws {
        use super::*;
        use proptest::prelude::*;

        /// Scalar leaves that can never look like ref tokens.
        fn literal_leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<bool>().prop_map(Value::from),
                any::<i64>().prop_map(Value::from),
                "[a-z]{0,12}".prop_map(Value::from),
            ]
        }

        fn literal_payload() -> impl Strategy<Value = Map<String, Value>> {
            proptest::collection::btree_map(
                "[a-z]{1,8}",
                prop_oneof![
                    literal_leaf(),
                    proptest::collection::vec(literal_leaf(), 0..4).prop_map(Value::from),
                ],
                0..6,
            )
            .prop_map(|m| {
                let mut payload: Map<String, Value> = m.into_iter().collect();
                payload.insert("op".into(), Value::from("createLayer"));
                payload
            })
        }

        proptest! {
            // Resolving a ref-free payload is the identity, and resolving
            // twice equals resolving once.
            #[test]
            fn resolution_is_idempotent(payload in literal_payload()) {
                let env = env_with(&[("layerA", json!({ "layerId": 1 }))]);
                let once = env.resolve_op(&payload).unwrap();
                prop_assert_eq!(&once, &payload);
                let twice = env.resolve_op(&once).unwrap();
                prop_assert_eq!(&twice, &once);
            }
        }
    }
}
