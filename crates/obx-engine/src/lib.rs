// SPDX-License-Identifier: MIT OR Apache-2.0
//! obx-engine
//!
//! The execution engine for opbatch.
//!
//! Responsibilities:
//! - validate the incoming envelope before any mutating work
//! - capture a best-effort checkpoint when the batch asks for one
//! - run ops linearly inside a single modal entry, under the batch
//!   error policy
//! - restore the checkpoint when rollback-on-error fires
//! - assemble the structured per-op result report

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Checkpoint capture, retention, and best-effort restore.
pub mod checkpoint;
/// The modal critical-section coordinator and host error normalization.
pub mod modal;
/// Per-op semantic checks against live host state.
pub mod preflight;
/// Batch result assembly.
pub mod report;
mod runner;

use obx_core::envelope::{EnvelopeError, parse_envelope};
use obx_core::{BatchEnvelope, BatchResult};
use obx_error::{ErrorCode, ExecError};
use obx_host::HostBridge;
use obx_registry::{Handler, HandlerRegistry, OpCatalog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

pub use checkpoint::{CheckpointManager, CheckpointStore, RestoreOutcome, SNAPSHOT_PREFIX};
pub use modal::{ModalCoordinator, is_busy, normalize_host_error};
pub use preflight::preflight as preflight_op;

/// Errors that abort a batch before any op runs.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The envelope failed structural validation.
    #[error("envelope validation failed: {0}")]
    Validation(#[from] EnvelopeError),
}

impl ExecutorError {
    /// The taxonomy code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::EnvelopeInvalid,
        }
    }

    /// Convert into the unified error type.
    pub fn into_exec_error(self) -> ExecError {
        match self {
            Self::Validation(e) => e.into_exec_error(),
        }
    }
}

/// Runtime knobs for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Per-op bound on a handler dispatch inside the modal entry.
    #[serde(with = "duration_millis")]
    pub modal_timeout: Duration,

    /// Total attempts to enter the modal gate while the host is busy.
    pub busy_max_retries: u32,

    /// Pause between busy attempts.
    #[serde(with = "duration_millis")]
    pub busy_backoff: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            modal_timeout: Duration::from_secs(30),
            busy_max_retries: 5,
            busy_backoff: Duration::from_millis(modal::BUSY_BACKOFF_MS),
        }
    }
}

/// Serde helper — `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// The operation batch executor.
///
/// Owns the alias/handler registries, the modal coordinator, and the
/// process-local checkpoint store.  One executor serves many batches;
/// mutating batches queue on the modal gate.
///
/// ```no_run
/// use obx_engine::Executor;
/// use obx_host::MemoryHost;
/// use std::sync::Arc;
///
/// let mut executor = Executor::new(Arc::new(MemoryHost::with_document("Poster")));
/// // executor.register_handler("createLayer", my_handler);
/// ```
pub struct Executor {
    pub(crate) host: Arc<dyn HostBridge>,
    pub(crate) catalog: OpCatalog,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) coordinator: ModalCoordinator,
    pub(crate) options: ExecutorOptions,
}

impl Executor {
    /// An executor with default options and an empty handler registry.
    #[must_use]
    pub fn new(host: Arc<dyn HostBridge>) -> Self {
        Self::with_options(host, ExecutorOptions::default())
    }

    /// An executor with explicit options.
    #[must_use]
    pub fn with_options(host: Arc<dyn HostBridge>, options: ExecutorOptions) -> Self {
        Self {
            host,
            catalog: OpCatalog::default(),
            handlers: HandlerRegistry::default(),
            checkpoints: CheckpointManager::new(),
            coordinator: ModalCoordinator::new(),
            options,
        }
    }

    /// Register a leaf handler under a primary op name.
    pub fn register_handler(&mut self, primary: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.register(primary, handler);
    }

    /// The alias/op catalog.
    #[must_use]
    pub fn catalog(&self) -> &OpCatalog {
        &self.catalog
    }

    /// The handler registry.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The checkpoint manager and its process-local store.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// The executor options in effect.
    #[must_use]
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Replace the executor options.
    pub fn set_options(&mut self, options: ExecutorOptions) {
        self.options = options;
    }

    /// The host this executor drives.
    #[must_use]
    pub fn host(&self) -> &dyn HostBridge {
        self.host.as_ref()
    }

    /// Validate a raw JSON envelope and run it.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::Validation`] when the envelope is structurally
    /// invalid; no op runs and no state changes in that case.  Every other
    /// failure is op-scoped and lands inside the returned [`BatchResult`].
    pub async fn apply_value(&self, raw: &Value) -> Result<BatchResult, ExecutorError> {
        let envelope = parse_envelope(raw)?;
        Ok(self.apply(envelope).await)
    }

    /// Run an already-validated envelope.
    pub async fn apply(&self, envelope: BatchEnvelope) -> BatchResult {
        let span = tracing::info_span!("obx.batch", tx = %envelope.transaction_id);
        runner::run_batch(self, envelope).instrument(span).await
    }

    /// Explicitly restore a retained checkpoint by id, inside the modal
    /// gate.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::CheckpointRestoreFailed`] for an unknown id, or the
    /// normalized modal-entry failure.
    pub async fn restore_checkpoint(&self, id: Uuid) -> Result<RestoreOutcome, ExecError> {
        let checkpoint = self.checkpoints.store().get(id).ok_or_else(|| {
            ExecError::new(
                ErrorCode::CheckpointRestoreFailed,
                format!("no retained checkpoint with id {id}"),
            )
        })?;
        let scope = self
            .coordinator
            .enter(self.host.as_ref(), &format!("restore:{id}"), &self.options)
            .await?;
        let outcome = self.checkpoints.restore(self.host.as_ref(), &checkpoint).await;
        scope.leave().await;
        Ok(outcome)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("handlers", &self.handlers)
            .field("options", &self.options)
            .finish()
    }
}
