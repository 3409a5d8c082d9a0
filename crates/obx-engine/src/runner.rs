// SPDX-License-Identifier: MIT OR Apache-2.0
//! The batch loop: resolve, canonicalize, preflight, dispatch, bind, and
//! record, one op at a time, in input order, under the batch error policy.
//!
//! A non-dry-run batch does all of its mutating work (checkpoint capture,
//! op dispatch, rollback restore) inside a single modal entry.  Dry-run
//! batches never touch the modal gate and bind placeholders instead of
//! dispatching.

use crate::Executor;
use crate::preflight::preflight;
use crate::report::BatchReportBuilder;
use obx_core::{
    BatchEnvelope, BatchResult, Checkpoint, OnErrorPolicy, OpResult, OpStatus, Operation,
    RollbackSummary,
};
use obx_error::{ErrorCode, ErrorReport, ExecError};
use obx_refs::{RefEnv, dry_run_placeholder};
use obx_registry::{HandlerCtx, ResolvedOp};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Successful outcome of one op slot.
struct StepOutcome {
    canonical: &'static str,
    status: OpStatus,
    result: Option<Value>,
    bound: Option<String>,
}

/// Failed outcome of one op slot.
struct StepFailure {
    canonical: Option<&'static str>,
    error: ExecError,
}

pub(crate) async fn run_batch(exec: &Executor, envelope: BatchEnvelope) -> BatchResult {
    let tx = envelope.transaction_id.clone();
    let safety = envelope.safety.clone();
    let mut env = RefEnv::seeded(envelope.refs.clone());
    let mut builder = BatchReportBuilder::new(&tx).dry_run(safety.dry_run);

    let default_on_error = safety.on_error.unwrap_or(if safety.continue_on_error {
        OnErrorPolicy::Continue
    } else {
        OnErrorPolicy::Abort
    });

    info!(
        target: "obx.engine",
        tx = %tx,
        ops = envelope.ops.len(),
        dry_run = safety.dry_run,
        on_error = %default_on_error,
        "batch accepted"
    );

    if safety.dry_run {
        run_ops(exec, &envelope, &mut env, &mut builder, default_on_error).await;
        builder.set_rollback(RollbackSummary {
            requested: safety.rollback_on_error,
            detail: Some("dry run: no checkpoint captured".into()),
            ..RollbackSummary::default()
        });
    } else {
        let command = format!("batch:{tx}");
        let scope = match exec
            .coordinator
            .enter(exec.host.as_ref(), &command, &exec.options)
            .await
        {
            Ok(scope) => scope,
            Err(err) => {
                // Aborted before op 0: no op results at all.
                warn!(target: "obx.engine", tx = %tx, error = %err, "batch never entered modal");
                builder.set_aborted();
                builder.set_detail(format!("batch aborted before the first op: {err}"));
                builder.set_rollback(RollbackSummary {
                    requested: safety.rollback_on_error,
                    ..RollbackSummary::default()
                });
                builder.set_refs(env.snapshot());
                return builder.build();
            }
        };

        let checkpoint = if safety.checkpoint || safety.rollback_on_error {
            let cp = exec
                .checkpoints
                .create(exec.host.as_ref(), Some(format!("tx:{tx}")))
                .await;
            builder.set_checkpoint_id(cp.id);
            Some(cp)
        } else {
            None
        };

        run_ops(exec, &envelope, &mut env, &mut builder, default_on_error).await;

        let summary = finish_rollback(exec, &safety, checkpoint, &mut builder).await;
        builder.set_rollback(summary);

        scope.leave().await;
    }

    builder.set_refs(env.snapshot());
    let result = builder.build();
    info!(
        target: "obx.engine",
        tx = %tx,
        applied = result.applied,
        failed = result.failed,
        aborted = result.aborted,
        "batch finished"
    );
    result
}

/// Build the rollback summary, restoring the checkpoint when warranted.
async fn finish_rollback(
    exec: &Executor,
    safety: &obx_core::SafetyOptions,
    checkpoint: Option<Checkpoint>,
    builder: &mut BatchReportBuilder,
) -> RollbackSummary {
    let mut summary = RollbackSummary {
        requested: safety.rollback_on_error,
        supported: checkpoint.as_ref().is_some_and(|c| c.restore_supported),
        strategy: checkpoint.as_ref().map(|c| c.strategy),
        checkpoint_id: checkpoint.as_ref().map(|c| c.id),
        detail: checkpoint.as_ref().map(|c| c.detail.clone()),
        ..RollbackSummary::default()
    };

    if safety.rollback_on_error && builder.failed_count() > 0 {
        summary.attempted = true;
        match &checkpoint {
            Some(cp) if cp.restore_supported => {
                let outcome = exec.checkpoints.restore(exec.host.as_ref(), cp).await;
                summary.restored = outcome.restored;
                summary.detail = Some(outcome.detail);
            }
            _ => {
                summary.detail =
                    Some("rollback requested but no restorable checkpoint was captured".into());
            }
        }
    }
    summary
}

async fn run_ops(
    exec: &Executor,
    envelope: &BatchEnvelope,
    env: &mut RefEnv,
    builder: &mut BatchReportBuilder,
    default_on_error: OnErrorPolicy,
) {
    let dry_run = envelope.safety.dry_run;
    let delay = envelope.safety.op_delay_ms.filter(|ms| *ms > 0);
    let total = envelope.ops.len();

    for (index, op) in envelope.ops.iter().enumerate() {
        if builder.aborted() {
            // Aborted: later slots emit nothing, forming a contiguous
            // omitted suffix.
            break;
        }

        let started = Instant::now();
        let on_error = op.on_error().unwrap_or(default_on_error);

        match execute_one(exec, env, op, index, &envelope.transaction_id, dry_run).await {
            Ok(outcome) => {
                debug!(
                    target: "obx.engine",
                    tx = %envelope.transaction_id,
                    index,
                    op = outcome.canonical,
                    status = ?outcome.status,
                    "op finished"
                );
                builder.push_op(OpResult {
                    index,
                    op: op.name().to_string(),
                    canonical_op: Some(outcome.canonical.to_string()),
                    on_error,
                    status: outcome.status,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ref_assigned: outcome.bound,
                    result: outcome.result,
                    error: None,
                });
            }
            Err(failure) => {
                warn!(
                    target: "obx.engine",
                    tx = %envelope.transaction_id,
                    index,
                    op = op.name(),
                    error = %failure.error,
                    "op failed"
                );
                builder.push_op(OpResult {
                    index,
                    op: op.name().to_string(),
                    canonical_op: failure.canonical.map(String::from),
                    on_error,
                    status: OpStatus::Failed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ref_assigned: None,
                    result: None,
                    error: Some(ErrorReport::from(&failure.error)),
                });
                if on_error == OnErrorPolicy::Abort {
                    builder.set_aborted();
                }
            }
        }

        if let Some(ms) = delay {
            if !dry_run && !builder.aborted() && index + 1 < total {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
    }
}

async fn execute_one(
    exec: &Executor,
    env: &mut RefEnv,
    op: &Operation,
    index: usize,
    tx: &str,
    dry_run: bool,
) -> Result<StepOutcome, StepFailure> {
    // Resolve refs eagerly, before anything else sees the payload.
    let resolved = env.resolve_op(&op.payload).map_err(|error| StepFailure {
        canonical: None,
        error: error.with_context("index", index),
    })?;

    let spec = exec.catalog.lookup(op.name()).map_err(|error| StepFailure {
        canonical: None,
        error: error.with_context("index", index),
    })?;

    preflight(exec.host.as_ref(), spec, &resolved, dry_run).map_err(|error| StepFailure {
        canonical: Some(spec.primary),
        error: error.with_context("index", index),
    })?;

    if dry_run {
        let bound = op.ref_assignment().map(|name| {
            let label = resolved
                .get("name")
                .or_else(|| resolved.get("title"))
                .and_then(Value::as_str);
            env.insert(name, dry_run_placeholder(index, spec.primary, spec.creates, label));
            name.to_string()
        });
        return Ok(StepOutcome {
            canonical: spec.primary,
            status: OpStatus::Validated,
            result: None,
            bound,
        });
    }

    let handler = exec.handlers.get(spec.primary).ok_or_else(|| StepFailure {
        canonical: Some(spec.primary),
        error: ExecError::new(
            ErrorCode::CommandUnavailable,
            format!("\"{}\" is not currently available: no handler registered", spec.primary),
        )
        .with_context("index", index),
    })?;

    let resolved_op = ResolvedOp {
        canonical: spec.primary,
        raw: op.name().to_string(),
        payload: resolved,
    };
    let ctx = HandlerCtx {
        refs: env.snapshot(),
        index,
        tx: tx.to_string(),
    };

    let value = match tokio::time::timeout(exec.options.modal_timeout, handler.call(resolved_op, ctx))
        .await
    {
        Err(_) => {
            return Err(StepFailure {
                canonical: Some(spec.primary),
                error: ExecError::new(
                    ErrorCode::ModalTimeout,
                    format!(
                        "\"{}\" exceeded the modal timeout of {} ms",
                        spec.primary,
                        exec.options.modal_timeout.as_millis()
                    ),
                )
                .with_context("index", index),
            });
        }
        Ok(Err(error)) => {
            return Err(StepFailure {
                canonical: Some(spec.primary),
                error: error.with_context("index", index),
            });
        }
        Ok(Ok(value)) => value,
    };

    let result = match value {
        Value::Null => json!({ "detail": format!("Executed '{}'", op.name()) }),
        Value::Object(fields) => Value::Object(fields),
        other => {
            return Err(StepFailure {
                canonical: Some(spec.primary),
                error: ExecError::new(
                    ErrorCode::HandlerContract,
                    format!(
                        "handler for \"{}\" returned a non-object result ({})",
                        spec.primary,
                        type_name(&other)
                    ),
                )
                .with_context("index", index),
            });
        }
    };

    // A failed op never binds its ref; we only get here on success.
    let bound = env.bind_result(op.ref_assignment(), Some(&result));

    Ok(StepOutcome {
        canonical: spec.primary,
        status: OpStatus::Applied,
        result: Some(result),
        bound,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
