// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared test fixture: an executor wired to a [`MemoryHost`] with a
//! realistic set of leaf handlers.

use obx_engine::{Executor, normalize_host_error};
use obx_host::target::resolve_layer_target;
use obx_host::{HostBridge, MemoryHost, document_ref_value, layer_ref_value};
use obx_registry::handler_fn;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct Fixture {
    pub host: Arc<MemoryHost>,
    pub executor: Executor,
}

#[allow(dead_code)]
pub fn fixture_empty() -> Fixture {
    build(Arc::new(MemoryHost::new()))
}

pub fn fixture_with_document(title: &str) -> Fixture {
    build(Arc::new(MemoryHost::with_document(title)))
}

/// Wire the standard handlers onto a caller-provided host.
#[allow(dead_code)]
pub fn fixture_from_host(host: Arc<MemoryHost>) -> Fixture {
    build(host)
}

fn target_layer(host: &MemoryHost, op: &obx_registry::ResolvedOp) -> Result<obx_host::LayerInfo, obx_error::ExecError> {
    let layers = host.layers();
    let active = host.active_layer();
    resolve_layer_target(&layers, active.as_ref(), op.field("target"))
}

fn build(host: Arc<MemoryHost>) -> Fixture {
    // Opt-in test tracing: RUST_LOG=obx=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut executor = Executor::new(host.clone());

    {
        let host = host.clone();
        executor.register_handler(
            "createDocument",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let title = op
                        .field("title")
                        .or_else(|| op.field("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("Untitled-1")
                        .to_string();
                    let doc = host.create_document(&title);
                    Ok(json!({
                        "document": document_ref_value(&doc),
                        "detail": format!("created document \"{title}\""),
                    }))
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "createLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let name = op
                        .field("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Layer")
                        .to_string();
                    let layer = host
                        .create_layer(&name)
                        .map_err(|e| normalize_host_error(e, "createLayer"))?;
                    Ok(json!({
                        "layer": layer_ref_value(&layer),
                        "detail": format!("created layer \"{name}\""),
                    }))
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "createTextLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let text = op
                        .field("text")
                        .or_else(|| op.field("contents"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let layer = host
                        .create_layer(&text)
                        .map_err(|e| normalize_host_error(e, "createTextLayer"))?;
                    Ok(json!({
                        "layer": layer_ref_value(&layer),
                        "text": text,
                    }))
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "renameLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let layer = target_layer(&host, &op)?;
                    let new_name = op
                        .field("newName")
                        .or_else(|| op.field("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let renamed = host
                        .rename_layer(layer.id, &new_name)
                        .map_err(|e| normalize_host_error(e, "renameLayer"))?;
                    Ok(json!({ "layer": layer_ref_value(&renamed) }))
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "deleteLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let layer = target_layer(&host, &op)?;
                    host.delete_layer(layer.id)
                        .map_err(|e| normalize_host_error(e, "deleteLayer"))?;
                    // Pure side effect: nothing bindable to return.
                    Ok(Value::Null)
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "duplicateLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let source = target_layer(&host, &op)?;
                    let copy = host
                        .create_layer(&format!("{} copy", source.name))
                        .map_err(|e| normalize_host_error(e, "duplicateLayer"))?;
                    Ok(json!({ "layer": layer_ref_value(&copy) }))
                }
            }),
        );
    }

    {
        let host = host.clone();
        executor.register_handler(
            "selectLayer",
            handler_fn(move |op, _ctx| {
                let host = host.clone();
                async move {
                    let layer = target_layer(&host, &op)?;
                    let selected = host
                        .select_layer(layer.id)
                        .map_err(|e| normalize_host_error(e, "selectLayer"))?;
                    Ok(json!({ "layer": layer_ref_value(&selected) }))
                }
            }),
        );
    }

    executor.register_handler(
        "batchPlay",
        handler_fn(|op, _ctx| async move {
            let count = op
                .field("commands")
                .and_then(Value::as_array)
                .map_or(1, Vec::len);
            Ok(json!({ "detail": format!("played {count} descriptor(s)") }))
        }),
    );

    executor.register_handler("flattenImage", handler_fn(|_op, _ctx| async move { Ok(Value::Null) }));

    Fixture { host, executor }
}
