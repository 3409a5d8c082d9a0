// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layer and document target resolution.
//!
//! Ops address layers and documents loosely: a numeric id, a numeric
//! string, a plain name, a tagged ref object, or a nested wrapper around
//! any of those.  Resolution searches the flattened list by id first
//! (numeric and string equality), then by name.  A missing target is
//! `TARGET_NOT_FOUND`; a target that still looks like an unresolved ref
//! token is `UNKNOWN_REF`; the top-level literal passthrough never
//! applies to targets.

use crate::{DocumentInfo, LayerInfo};
use obx_error::{ErrorCode, ExecError};
use serde_json::Value;

/// Wrapper keys unwrapped before matching a target value.
const WRAPPER_KEYS: &[&str] = &["target", "layer", "ref"];

/// Peel nested `{ target | layer | ref }` wrappers off a target value.
fn unwrap_target(mut value: &Value) -> &Value {
    loop {
        let Some(obj) = value.as_object() else {
            return value;
        };
        let inner = WRAPPER_KEYS.iter().find_map(|k| obj.get(*k));
        match inner {
            // `{ kind: "layer", ... }` objects carry no wrapper keys other
            // than possibly `ref: "active"` on documents, which is a leaf.
            Some(v) if v.is_object() || v.is_number() || v.is_string() => value = v,
            _ => return value,
        }
    }
}

fn id_of(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = value.get(*k)?;
        v.as_i64().or_else(|| v.as_str()?.parse().ok())
    })
}

fn name_of<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k)?.as_str())
}

fn find_layer(layers: &[LayerInfo], id: Option<i64>, name: Option<&str>) -> Option<LayerInfo> {
    if let Some(id) = id {
        if let Some(hit) = layers.iter().find(|l| l.id == id) {
            return Some(hit.clone());
        }
    }
    name.and_then(|n| layers.iter().find(|l| l.name == n).cloned())
}

/// Resolve a layer target against the flattened layer list.
///
/// `target == None` means "the currently targeted layer".
///
/// # Errors
///
/// [`ErrorCode::UnknownRef`] for `$`-prefixed strings,
/// [`ErrorCode::TargetNotFound`] otherwise.
pub fn resolve_layer_target(
    layers: &[LayerInfo],
    active: Option<&LayerInfo>,
    target: Option<&Value>,
) -> Result<LayerInfo, ExecError> {
    let not_found = |shown: &str| {
        ExecError::new(
            ErrorCode::TargetNotFound,
            format!("layer target {shown} not found"),
        )
        .with_context("target", shown)
    };

    let target = match target {
        None | Some(Value::Null) => {
            return active
                .cloned()
                .ok_or_else(|| not_found("(active)"));
        }
        Some(v) => unwrap_target(v),
    };

    match target {
        Value::Number(n) => {
            let id = n.as_i64();
            find_layer(layers, id, None).ok_or_else(|| not_found(&n.to_string()))
        }
        Value::String(s) => {
            if s.starts_with('$') {
                return Err(ExecError::new(
                    ErrorCode::UnknownRef,
                    format!("unknown ref \"{s}\" used as layer target"),
                )
                .with_context("token", s.as_str()));
            }
            let id = s.parse::<i64>().ok();
            find_layer(layers, id, Some(s)).ok_or_else(|| not_found(&format!("\"{s}\"")))
        }
        Value::Object(_) => {
            let id = id_of(target, &["layerId", "id"]);
            let name = name_of(target, &["layerName", "name"]);
            find_layer(layers, id, name).ok_or_else(|| {
                let shown = name
                    .map(|n| format!("\"{n}\""))
                    .or_else(|| id.map(|i| i.to_string()))
                    .unwrap_or_else(|| "(unrecognized shape)".into());
                not_found(&shown)
            })
        }
        other => Err(not_found(&other.to_string())),
    }
}

fn find_document(docs: &[DocumentInfo], id: Option<i64>, title: Option<&str>) -> Option<DocumentInfo> {
    if let Some(id) = id {
        if let Some(hit) = docs.iter().find(|d| d.id == id) {
            return Some(hit.clone());
        }
    }
    title.and_then(|t| docs.iter().find(|d| d.title == t).cloned())
}

/// Resolve a document target against the open-document list.
///
/// `"active"` (and `target == None`) mean the host's active document.
///
/// # Errors
///
/// Same vocabulary as [`resolve_layer_target`].
pub fn resolve_document_target(
    docs: &[DocumentInfo],
    active: Option<&DocumentInfo>,
    target: Option<&Value>,
) -> Result<DocumentInfo, ExecError> {
    let not_found = |shown: &str| {
        ExecError::new(
            ErrorCode::TargetNotFound,
            format!("document target {shown} not found"),
        )
        .with_context("target", shown)
    };

    let target = match target {
        None | Some(Value::Null) => {
            return active.cloned().ok_or_else(|| not_found("(active)"));
        }
        Some(v) => v,
    };

    match target {
        Value::Number(n) => {
            find_document(docs, n.as_i64(), None).ok_or_else(|| not_found(&n.to_string()))
        }
        Value::String(s) if s == "active" => active.cloned().ok_or_else(|| not_found("(active)")),
        Value::String(s) => {
            if s.starts_with('$') {
                return Err(ExecError::new(
                    ErrorCode::UnknownRef,
                    format!("unknown ref \"{s}\" used as document target"),
                )
                .with_context("token", s.as_str()));
            }
            let id = s.parse::<i64>().ok();
            find_document(docs, id, Some(s)).ok_or_else(|| not_found(&format!("\"{s}\"")))
        }
        Value::Object(obj) => {
            if obj.get("ref").and_then(Value::as_str) == Some("active") {
                return active.cloned().ok_or_else(|| not_found("(active)"));
            }
            let id = id_of(target, &["docId", "id"]);
            let title = name_of(target, &["title", "docTitle"]);
            find_document(docs, id, title).ok_or_else(|| {
                let shown = title
                    .map(|t| format!("\"{t}\""))
                    .or_else(|| id.map(|i| i.to_string()))
                    .unwrap_or_else(|| "(unrecognized shape)".into());
                not_found(&shown)
            })
        }
        other => Err(not_found(&other.to_string())),
    }
}
