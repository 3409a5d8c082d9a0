// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fluent builder assembling the per-batch [`BatchResult`].

use obx_core::{BatchResult, CapabilityBlock, OpResult, OpStatus, RollbackSummary};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Accumulates op outcomes and batch facts into a [`BatchResult`].
///
/// # Examples
///
/// ```
/// use obx_engine::report::BatchReportBuilder;
///
/// let result = BatchReportBuilder::new("t1").build();
/// assert_eq!(result.transaction_id, "t1");
/// assert_eq!(result.applied + result.failed, 0);
/// ```
#[derive(Debug)]
pub struct BatchReportBuilder {
    transaction_id: String,
    dry_run: bool,
    aborted: bool,
    checkpoint_id: Option<Uuid>,
    rollback: RollbackSummary,
    refs: BTreeMap<String, Value>,
    op_results: Vec<OpResult>,
    applied: u32,
    failed: u32,
    detail_override: Option<String>,
}

impl BatchReportBuilder {
    /// Start a report for the given transaction.
    #[must_use]
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            dry_run: false,
            aborted: false,
            checkpoint_id: None,
            rollback: RollbackSummary::default(),
            refs: BTreeMap::new(),
            op_results: Vec::new(),
            applied: 0,
            failed: 0,
            detail_override: None,
        }
    }

    /// Mark the batch as a dry run.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Record an op outcome, updating the counters.
    pub fn push_op(&mut self, result: OpResult) {
        match result.status {
            OpStatus::Applied | OpStatus::Validated => self.applied += 1,
            OpStatus::Failed => self.failed += 1,
            OpStatus::Skipped => {}
        }
        self.op_results.push(result);
    }

    /// Mark the batch aborted.
    pub fn set_aborted(&mut self) {
        self.aborted = true;
    }

    /// Whether the batch has been marked aborted.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Number of failed ops recorded so far.
    pub fn failed_count(&self) -> u32 {
        self.failed
    }

    /// Attach the pre-batch checkpoint id.
    pub fn set_checkpoint_id(&mut self, id: Uuid) {
        self.checkpoint_id = Some(id);
    }

    /// Attach the rollback summary.
    pub fn set_rollback(&mut self, rollback: RollbackSummary) {
        self.rollback = rollback;
    }

    /// Attach the final ref environment snapshot.
    pub fn set_refs(&mut self, refs: BTreeMap<String, Value>) {
        self.refs = refs;
    }

    /// Replace the generated one-line summary.
    pub fn set_detail(&mut self, detail: impl Into<String>) {
        self.detail_override = Some(detail.into());
    }

    /// Produce the final [`BatchResult`].
    #[must_use]
    pub fn build(self) -> BatchResult {
        let total = self.op_results.len();
        let detail = self.detail_override.unwrap_or_else(|| {
            let mut line = if self.dry_run {
                format!("dry run: validated {} of {total} ops", self.applied)
            } else {
                format!("applied {} of {total} ops", self.applied)
            };
            if self.failed > 0 {
                line.push_str(&format!(", {} failed", self.failed));
            }
            if self.aborted {
                line.push_str(", aborted");
            }
            if self.rollback.attempted {
                line.push_str(if self.rollback.restored {
                    ", rolled back"
                } else {
                    ", rollback failed"
                });
            }
            line
        });

        BatchResult {
            transaction_id: self.transaction_id,
            dry_run: self.dry_run,
            applied: self.applied,
            failed: self.failed,
            aborted: self.aborted,
            checkpoint_id: self.checkpoint_id,
            rollback: self.rollback,
            refs: self.refs,
            op_results: self.op_results,
            capabilities: CapabilityBlock::default(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_core::OnErrorPolicy;
    use obx_error::{ErrorCode, ErrorReport, ExecError};

    fn op(index: usize, status: OpStatus) -> OpResult {
        OpResult {
            index,
            op: "createLayer".into(),
            canonical_op: Some("createLayer".into()),
            on_error: OnErrorPolicy::Abort,
            status,
            duration_ms: 1,
            ref_assigned: None,
            result: None,
            error: (status == OpStatus::Failed).then(|| {
                ErrorReport::from(&ExecError::new(ErrorCode::TargetNotFound, "layer target not found"))
            }),
        }
    }

    #[test]
    fn counts_follow_statuses() {
        let mut b = BatchReportBuilder::new("t1");
        b.push_op(op(0, OpStatus::Applied));
        b.push_op(op(1, OpStatus::Failed));
        b.push_op(op(2, OpStatus::Applied));
        let result = b.build();
        assert_eq!(result.applied, 2);
        assert_eq!(result.failed, 1);
        assert!(!result.aborted);
        assert_eq!(result.op_results.len(), 3);
        assert!(result.detail.contains("applied 2 of 3"));
        assert!(result.detail.contains("1 failed"));
    }

    #[test]
    fn dry_run_detail_counts_validated() {
        let mut b = BatchReportBuilder::new("t1").dry_run(true);
        b.push_op(op(0, OpStatus::Validated));
        let result = b.build();
        assert!(result.dry_run);
        assert_eq!(result.applied, 1);
        assert!(result.detail.contains("dry run"));
    }

    #[test]
    fn rollback_outcome_reaches_detail() {
        let mut b = BatchReportBuilder::new("t1");
        b.push_op(op(0, OpStatus::Failed));
        b.set_aborted();
        b.set_rollback(RollbackSummary {
            requested: true,
            attempted: true,
            restored: true,
            ..RollbackSummary::default()
        });
        let result = b.build();
        assert!(result.detail.contains("aborted"));
        assert!(result.detail.contains("rolled back"));
    }

    #[test]
    fn capability_block_is_always_advertised() {
        let result = BatchReportBuilder::new("t1").build();
        assert!(result.capabilities.op_local_refs);
        assert!(result.capabilities.rollback_on_error.supported);
    }
}
