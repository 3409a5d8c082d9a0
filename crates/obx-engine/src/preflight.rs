// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-op preflight: semantic checks that need the resolved op and live
//! host state, run before any dispatch.
//!
//! Order is fixed: active-document guard, layer-target guard,
//! required-field matrix.  In dry-run the layer-target guard checks shape
//! only, since earlier ops in the batch have not actually created their
//! layers yet and a live lookup would spuriously fail.

use obx_error::{ErrorCode, ExecError};
use obx_host::{HostBridge, target::resolve_layer_target};
use obx_registry::{OpSpec, is_meaningful};
use serde_json::{Map, Value};

/// Payload fields consulted, in order, for a layer target.
const TARGET_FIELDS: &[&str] = &["target", "layer", "layerId"];

/// The op's target value, if it carries one.
pub fn target_of(payload: &Map<String, Value>) -> Option<&Value> {
    TARGET_FIELDS
        .iter()
        .find_map(|f| payload.get(*f))
        .filter(|v| !v.is_null())
}

/// Run the preflight checks for one resolved op.
///
/// # Errors
///
/// [`ErrorCode::NoActiveDocument`], [`ErrorCode::TargetNotFound`] /
/// [`ErrorCode::UnknownRef`], or [`ErrorCode::MissingRequiredField`], in
/// that check order.
pub fn preflight(
    host: &dyn HostBridge,
    spec: &OpSpec,
    payload: &Map<String, Value>,
    dry_run: bool,
) -> Result<(), ExecError> {
    if spec.needs_document && host.active_document().is_none() {
        return Err(ExecError::new(
            ErrorCode::NoActiveDocument,
            format!("\"{}\" requires an active document and none is open", spec.primary),
        )
        .with_context("op", spec.primary));
    }

    if spec.needs_layer_target {
        let target = target_of(payload);
        if dry_run {
            // Shape check only: a target that still looks like an
            // unresolved ref token is wrong even when nothing executes.
            if let Some(Value::String(s)) = target {
                if s.starts_with('$') {
                    return Err(ExecError::new(
                        ErrorCode::UnknownRef,
                        format!("unknown ref \"{s}\" used as layer target"),
                    )
                    .with_context("op", spec.primary)
                    .with_context("token", s.as_str()));
                }
            }
        } else {
            let layers = host.layers();
            let active = host.active_layer();
            resolve_layer_target(&layers, active.as_ref(), target)
                .map_err(|e| e.with_context("op", spec.primary))?;
        }
    }

    for group in spec.required {
        let satisfied = group
            .iter()
            .any(|field| payload.get(*field).is_some_and(is_meaningful));
        if !satisfied {
            return Err(ExecError::new(
                ErrorCode::MissingRequiredField,
                format!("\"{}\" requires one of: {}", spec.primary, group.join("|")),
            )
            .with_context("op", spec.primary)
            .with_context("group", group.join("|")));
        }
    }

    Ok(())
}
