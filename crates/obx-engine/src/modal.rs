// SPDX-License-Identifier: MIT OR Apache-2.0
//! Modal coordination: the single cooperative critical section.
//!
//! The host only permits document mutation "inside modal".  The
//! coordinator guards entry with a single-permit semaphore (no reentrancy,
//! no parallel batches), retries transient busy collisions with a bounded
//! fixed pause, and translates the host's error vocabulary into stable
//! codes.  One batch enters modal once; per-op timeouts are applied by the
//! runner around each handler dispatch.

use crate::ExecutorOptions;
use obx_error::{ErrorCode, ExecError};
use obx_host::{HostBridge, HostError};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Pause between attempts when the host reports its modal state busy.
pub const BUSY_BACKOFF_MS: u64 = 350;

/// Serializes all mutating execution through the host's modal gate.
#[derive(Debug)]
pub struct ModalCoordinator {
    permit: Semaphore,
}

impl Default for ModalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalCoordinator {
    /// A coordinator with a single permit.
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// Enter the modal gate for one batch.
    ///
    /// Waits for the local permit (queueing behind other batches), then
    /// asks the host to open a modal scope, retrying up to
    /// `opts.busy_max_retries` attempts total while the host reports
    /// "modal state busy".  Any other host failure short-circuits to
    /// normalization.
    ///
    /// # Errors
    ///
    /// The normalized host error, [`ErrorCode::HostBusy`] when retries
    /// exhaust.
    pub async fn enter<'a>(
        &'a self,
        host: &'a dyn HostBridge,
        command_name: &str,
        opts: &ExecutorOptions,
    ) -> Result<ModalScope<'a>, ExecError> {
        let permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| ExecError::new(ErrorCode::Internal, "modal coordinator closed"))?;

        let max_attempts = opts.busy_max_retries.max(1);
        for attempt in 0..max_attempts {
            match host.begin_modal(command_name).await {
                Ok(()) => {
                    debug!(
                        target: "obx.modal",
                        command = command_name,
                        attempt,
                        "entered modal scope"
                    );
                    return Ok(ModalScope {
                        host,
                        _permit: permit,
                    });
                }
                Err(err) if is_busy(&err) && attempt + 1 < max_attempts => {
                    warn!(
                        target: "obx.modal",
                        command = command_name,
                        attempt,
                        error = %err,
                        backoff_ms = opts.busy_backoff.as_millis() as u64,
                        "host modal busy, backing off"
                    );
                    tokio::time::sleep(opts.busy_backoff).await;
                }
                Err(err) => {
                    warn!(
                        target: "obx.modal",
                        command = command_name,
                        attempt,
                        error = %err,
                        "modal entry failed"
                    );
                    return Err(normalize_host_error(err, command_name));
                }
            }
        }
        // The loop always returns on its last attempt; handle gracefully
        // anyway.
        Err(ExecError::new(
            ErrorCode::HostBusy,
            format!("host modal state stayed busy while executing \"{command_name}\""),
        ))
    }
}

/// An open modal scope: held for the whole batch, left exactly once.
pub struct ModalScope<'a> {
    host: &'a dyn HostBridge,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for ModalScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModalScope").finish_non_exhaustive()
    }
}

impl ModalScope<'_> {
    /// Leave the modal scope.
    pub async fn leave(self) {
        self.host.end_modal().await;
        debug!(target: "obx.modal", "left modal scope");
    }
}

/// `true` when the failure is a transient modal-busy collision.
pub fn is_busy(err: &HostError) -> bool {
    match err {
        HostError::ModalBusy { .. } => true,
        HostError::Message(text) => {
            let t = text.to_ascii_lowercase();
            t.contains("modal state") && t.contains("busy")
        }
        _ => false,
    }
}

/// Translate a host failure into a stable error code with an actionable
/// message.
///
/// Typed vocabulary maps directly; adapter text is scanned for the
/// recognizable host phrases.  Anything else is `INTERNAL` with the host
/// text preserved.
pub fn normalize_host_error(err: HostError, op: &str) -> ExecError {
    let exec = match &err {
        HostError::ModalBusy { .. } => ExecError::new(
            ErrorCode::HostBusy,
            format!("host modal state stayed busy while executing \"{op}\"; close any open dialog and retry"),
        ),
        HostError::CommandUnavailable { command } => ExecError::new(
            ErrorCode::CommandUnavailable,
            format!("\"{command}\" is not currently available in this host state"),
        ),
        HostError::ProgramError { command } => ExecError::new(
            ErrorCode::HostProgramError,
            format!("host program error while executing \"{command}\""),
        ),
        HostError::InvalidDocument => ExecError::new(
            ErrorCode::InvalidDocument,
            format!("\"{op}\" targets something that is not a valid document"),
        ),
        HostError::Message(text) => {
            let t = text.to_ascii_lowercase();
            if t.contains("busy") && t.contains("modal") {
                ExecError::new(
                    ErrorCode::HostBusy,
                    format!("host modal state stayed busy while executing \"{op}\"; close any open dialog and retry"),
                )
            } else if t.contains("not currently available") {
                ExecError::new(
                    ErrorCode::CommandUnavailable,
                    format!("\"{op}\" is not currently available in this host state"),
                )
            } else if t.contains("program error") {
                ExecError::new(
                    ErrorCode::HostProgramError,
                    format!("host program error while executing \"{op}\""),
                )
            } else if t.contains("not a valid document") {
                ExecError::new(
                    ErrorCode::InvalidDocument,
                    format!("\"{op}\" targets something that is not a valid document"),
                )
            } else {
                ExecError::new(ErrorCode::Internal, format!("host failure while executing \"{op}\""))
            }
        }
        _ => ExecError::new(ErrorCode::Internal, format!("host failure while executing \"{op}\"")),
    };
    exec.with_context("op", op).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutorOptions;
    use obx_host::MemoryHost;
    use std::time::Duration;

    fn fast_opts() -> ExecutorOptions {
        ExecutorOptions {
            busy_backoff: Duration::from_millis(1),
            ..ExecutorOptions::default()
        }
    }

    #[tokio::test]
    async fn enters_and_leaves() {
        let host = MemoryHost::with_document("Poster");
        let coord = ModalCoordinator::new();
        let scope = coord.enter(&host, "batch:t1", &fast_opts()).await.unwrap();
        scope.leave().await;
        // Gate is free again.
        let scope = coord.enter(&host, "batch:t2", &fast_opts()).await.unwrap();
        scope.leave().await;
    }

    #[tokio::test]
    async fn retries_past_transient_busy() {
        let host = MemoryHost::with_document("Poster");
        host.refuse_modal_entries(3);
        let coord = ModalCoordinator::new();
        let scope = coord.enter(&host, "batch:t1", &fast_opts()).await.unwrap();
        scope.leave().await;
    }

    #[tokio::test]
    async fn busy_surfaces_after_retries_exhaust() {
        let host = MemoryHost::with_document("Poster");
        host.refuse_modal_entries(100);
        let coord = ModalCoordinator::new();
        let err = coord.enter(&host, "batch:t1", &fast_opts()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HostBusy);
    }

    #[test]
    fn normalizes_adapter_text() {
        let cases = [
            ("The modal state is currently busy", ErrorCode::HostBusy),
            ("command is not currently available", ErrorCode::CommandUnavailable),
            ("general Photoshop program error occurred", ErrorCode::HostProgramError),
            ("the target is not a valid document", ErrorCode::InvalidDocument),
            ("something exploded", ErrorCode::Internal),
        ];
        for (text, expected) in cases {
            let err = normalize_host_error(HostError::Message(text.into()), "renameLayer");
            assert_eq!(err.code, expected, "for {text:?}");
            assert_eq!(err.context["op"], serde_json::json!("renameLayer"));
        }
    }

    #[test]
    fn busy_detection() {
        assert!(is_busy(&HostError::ModalBusy { detail: "x".into() }));
        assert!(is_busy(&HostError::Message("modal state was busy".into())));
        assert!(!is_busy(&HostError::InvalidDocument));
    }
}
