//! Unified error taxonomy with stable error codes for the opbatch executor.
//!
//! Every executor error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context.  Use the builder returned by
//! [`ExecError::new`] to construct errors fluently.
//!
//! Only envelope validation aborts a batch; every other code surfaces as a
//! failed op result, serialized through [`ErrorReport`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Structural problems with the incoming batch envelope.
    Envelope,
    /// Op-name resolution errors.
    Op,
    /// Ref token resolution errors.
    Ref,
    /// Per-op preflight guard failures.
    Preflight,
    /// Normalized host failures (modal gate, host API vocabulary).
    Host,
    /// Leaf handler contract violations.
    Handler,
    /// Checkpoint creation / restoration problems.
    Checkpoint,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Envelope => "envelope",
            Self::Op => "op",
            Self::Ref => "ref",
            Self::Preflight => "preflight",
            Self::Host => "host",
            Self::Handler => "handler",
            Self::Checkpoint => "checkpoint",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.  The code string is also
/// what lands in the `name` field of a failed op's [`ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Envelope --
    /// The batch envelope failed structural validation. Fatal: no ops run.
    EnvelopeInvalid,

    // -- Op --
    /// The op name missed the alias table.
    UnknownOp,

    // -- Ref --
    /// A ref token could not be resolved against the environment.
    UnknownRef,

    // -- Preflight --
    /// The op requires an active document and none is open.
    NoActiveDocument,
    /// The op's layer target could not be resolved against the document.
    TargetNotFound,
    /// A required field group for the canonical op is unsatisfied.
    MissingRequiredField,

    // -- Host --
    /// The host's modal gate is occupied (mid-dialog / transform / edit).
    HostBusy,
    /// The host reports the command as not currently available.
    CommandUnavailable,
    /// The host raised a program error while executing the command.
    HostProgramError,
    /// The host reports the target document as not valid.
    InvalidDocument,
    /// The modal entry exceeded its timeout.
    ModalTimeout,

    // -- Handler --
    /// A leaf handler returned a value outside its contract.
    HandlerContract,

    // -- Checkpoint --
    /// Checkpoint creation failed; rollback capability is reduced.
    CheckpointCreateFailed,
    /// Checkpoint restoration failed; the document may be partially mutated.
    CheckpointRestoreFailed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EnvelopeInvalid => ErrorCategory::Envelope,

            Self::UnknownOp => ErrorCategory::Op,

            Self::UnknownRef => ErrorCategory::Ref,

            Self::NoActiveDocument | Self::TargetNotFound | Self::MissingRequiredField => {
                ErrorCategory::Preflight
            }

            Self::HostBusy
            | Self::CommandUnavailable
            | Self::HostProgramError
            | Self::InvalidDocument
            | Self::ModalTimeout => ErrorCategory::Host,

            Self::HandlerContract => ErrorCategory::Handler,

            Self::CheckpointCreateFailed | Self::CheckpointRestoreFailed => {
                ErrorCategory::Checkpoint
            }

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"TARGET_NOT_FOUND"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvelopeInvalid => "ENVELOPE_INVALID",
            Self::UnknownOp => "UNKNOWN_OP",
            Self::UnknownRef => "UNKNOWN_REF",
            Self::NoActiveDocument => "NO_ACTIVE_DOCUMENT",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::HostBusy => "HOST_BUSY",
            Self::CommandUnavailable => "COMMAND_UNAVAILABLE",
            Self::HostProgramError => "HOST_PROGRAM_ERROR",
            Self::InvalidDocument => "INVALID_DOCUMENT",
            Self::ModalTimeout => "MODAL_TIMEOUT",
            Self::HandlerContract => "HANDLER_CONTRACT",
            Self::CheckpointCreateFailed => "CHECKPOINT_CREATE_FAILED",
            Self::CheckpointRestoreFailed => "CHECKPOINT_RESTORE_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Returns `true` when this code is fatal for the whole batch.
    ///
    /// Only envelope validation short-circuits; every other code fails the
    /// op it belongs to and lets the batch policy decide what happens next.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Self::EnvelopeInvalid)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecError
// ---------------------------------------------------------------------------

/// Unified executor error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use obx_error::{ErrorCode, ExecError};
///
/// let err = ExecError::new(ErrorCode::TargetNotFound, "layer target \"logo\" not found")
///     .with_context("op", "renameLayer")
///     .with_context("index", 3);
/// ```
pub struct ExecError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ExecError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ExecError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// ErrorReport
// ---------------------------------------------------------------------------

/// Maximum number of cause-chain entries retained in an [`ErrorReport`].
pub const MAX_CHAIN_LINES: usize = 6;

/// Serialisable snapshot of an [`ExecError`] as it appears in an op result.
///
/// `name` is the stable code string.  `chain` flattens the source chain,
/// outermost cause first, truncated to [`MAX_CHAIN_LINES`] entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Stable error-code string (e.g. `"UNKNOWN_REF"`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Truncated cause chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl From<&ExecError> for ErrorReport {
    fn from(err: &ExecError) -> Self {
        let mut chain = Vec::new();
        let mut cursor: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(err);
        while let Some(cause) = cursor {
            if chain.len() == MAX_CHAIN_LINES {
                break;
            }
            chain.push(cause.to_string());
            cursor = cause.source();
        }
        Self {
            name: err.code.as_str().to_string(),
            message: err.message.clone(),
            context: err.context.clone(),
            chain,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
