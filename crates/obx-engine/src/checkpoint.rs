// SPDX-License-Identifier: MIT OR Apache-2.0
//! Checkpoints: best-effort restorable anchors over heterogeneous,
//! sometimes-lossy host snapshot backends.
//!
//! Creation records the host's history state pointer, then attempts a
//! named full-document snapshot; whichever strategies succeed are recorded
//! on the [`Checkpoint`].  Restoration tries the snapshot first, then the
//! state pointer if its id is still present in the host's state list.
//! Both directions are non-fatal: failure reduces capability and is
//! reported, never raised.
//!
//! Checkpoints outlive the batch that created them and stay in the
//! process-local store until explicitly discarded.

use chrono::Utc;
use obx_core::{Checkpoint, CheckpointStrategy, RollbackBehavior};
use obx_host::HostBridge;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of the deterministic host snapshot name, `<prefix>:<checkpointId>`.
pub const SNAPSHOT_PREFIX: &str = "obx";

/// Outcome of a restoration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Whether the host reported a successful restore.
    pub restored: bool,
    /// The strategy that succeeded, when one did.
    pub strategy: Option<CheckpointStrategy>,
    /// Human-readable outcome.
    pub detail: String,
}

/// Process-local checkpoint registry keyed by checkpoint id.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    inner: Arc<Mutex<BTreeMap<Uuid, Checkpoint>>>,
}

impl CheckpointStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, Checkpoint>> {
        self.inner.lock().expect("checkpoint store lock poisoned")
    }

    /// Fetch a checkpoint by id.
    pub fn get(&self, id: Uuid) -> Option<Checkpoint> {
        self.lock().get(&id).cloned()
    }

    /// All retained checkpoints, oldest id ordering not guaranteed.
    pub fn list(&self) -> Vec<Checkpoint> {
        self.lock().values().cloned().collect()
    }

    /// Discard a checkpoint, returning it if it existed.
    pub fn discard(&self, id: Uuid) -> Option<Checkpoint> {
        self.lock().remove(&id)
    }

    fn insert(&self, checkpoint: Checkpoint) {
        self.lock().insert(checkpoint.id, checkpoint);
    }
}

/// Creates, retains, and restores checkpoints against a host.
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    store: CheckpointStore,
}

impl CheckpointManager {
    /// A manager with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying process-local store.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Capture a pre-batch checkpoint using the layered strategy.
    ///
    /// Never fails: a checkpoint with `strategy == None` and
    /// `restore_supported == false` records that nothing could be
    /// captured.
    pub async fn create(&self, host: &dyn HostBridge, label: Option<String>) -> Checkpoint {
        let id = Uuid::new_v4();

        let state_id = host.current_state_id();
        let snapshot_name = format!("{SNAPSHOT_PREFIX}:{id}");
        let snapshot_name = match host.create_snapshot(&snapshot_name).await {
            Ok(()) => Some(snapshot_name),
            Err(err) => {
                warn!(
                    target: "obx.checkpoint",
                    checkpoint = %id,
                    error = %err,
                    "snapshot capture failed, falling back to state pointer"
                );
                None
            }
        };

        let strategy = if snapshot_name.is_some() {
            CheckpointStrategy::Snapshot
        } else if state_id.is_some() {
            CheckpointStrategy::StatePointer
        } else {
            CheckpointStrategy::None
        };
        let restore_supported = strategy != CheckpointStrategy::None;

        let detail = match strategy {
            CheckpointStrategy::Snapshot => format!(
                "captured snapshot {} (state pointer {})",
                snapshot_name.as_deref().unwrap_or("?"),
                state_id.map_or_else(|| "unavailable".into(), |s| s.to_string()),
            ),
            CheckpointStrategy::StatePointer => format!(
                "snapshot unavailable; captured state pointer {}",
                state_id.unwrap_or_default()
            ),
            CheckpointStrategy::None => "host offers no restorable anchor".to_string(),
        };

        debug!(
            target: "obx.checkpoint",
            checkpoint = %id,
            strategy = %strategy,
            restore_supported,
            "checkpoint created"
        );

        let checkpoint = Checkpoint {
            id,
            created_at: Utc::now(),
            label,
            strategy,
            restore_supported,
            behavior: RollbackBehavior::BestEffort,
            snapshot_name,
            state_id,
            detail,
        };
        self.store.insert(checkpoint.clone());
        checkpoint
    }

    /// Best-effort restore of a checkpoint: snapshot first, then the
    /// state pointer if the host still lists it.
    pub async fn restore(&self, host: &dyn HostBridge, checkpoint: &Checkpoint) -> RestoreOutcome {
        if let Some(name) = &checkpoint.snapshot_name {
            match host.select_snapshot(name).await {
                Ok(()) => {
                    debug!(
                        target: "obx.checkpoint",
                        checkpoint = %checkpoint.id,
                        "restored via snapshot"
                    );
                    return RestoreOutcome {
                        restored: true,
                        strategy: Some(CheckpointStrategy::Snapshot),
                        detail: format!("restored snapshot {name}"),
                    };
                }
                Err(err) => {
                    warn!(
                        target: "obx.checkpoint",
                        checkpoint = %checkpoint.id,
                        error = %err,
                        "snapshot restore failed, trying state pointer"
                    );
                }
            }
        }

        if let Some(state_id) = checkpoint.state_id {
            if host.list_states().iter().any(|s| s.id == state_id) {
                match host.select_state(state_id).await {
                    Ok(()) => {
                        debug!(
                            target: "obx.checkpoint",
                            checkpoint = %checkpoint.id,
                            state_id,
                            "restored via state pointer"
                        );
                        return RestoreOutcome {
                            restored: true,
                            strategy: Some(CheckpointStrategy::StatePointer),
                            detail: format!("restored history state {state_id}"),
                        };
                    }
                    Err(err) => {
                        warn!(
                            target: "obx.checkpoint",
                            checkpoint = %checkpoint.id,
                            state_id,
                            error = %err,
                            "state pointer restore failed"
                        );
                        return RestoreOutcome {
                            restored: false,
                            strategy: None,
                            detail: format!("history state {state_id} could not be selected: {err}"),
                        };
                    }
                }
            }
            return RestoreOutcome {
                restored: false,
                strategy: None,
                detail: format!("history state {state_id} was pruned by the host"),
            };
        }

        RestoreOutcome {
            restored: false,
            strategy: None,
            detail: "checkpoint has no restorable anchor".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_host::MemoryHost;

    #[tokio::test]
    async fn creation_prefers_snapshot() {
        let host = MemoryHost::with_document("Poster");
        let manager = CheckpointManager::new();
        let cp = manager.create(&host, Some("pre-batch".into())).await;
        assert_eq!(cp.strategy, CheckpointStrategy::Snapshot);
        assert!(cp.restore_supported);
        assert!(cp.snapshot_name.as_deref().unwrap().starts_with("obx:"));
        assert!(cp.state_id.is_some());
        assert_eq!(manager.store().get(cp.id).unwrap().id, cp.id);
    }

    #[tokio::test]
    async fn creation_without_document_degrades() {
        let host = MemoryHost::new();
        let manager = CheckpointManager::new();
        let cp = manager.create(&host, None).await;
        // No document: the snapshot fails and no state was ever recorded.
        assert_eq!(cp.strategy, CheckpointStrategy::None);
        assert!(!cp.restore_supported);
    }

    #[tokio::test]
    async fn restore_via_snapshot() {
        let host = MemoryHost::with_document("Poster");
        host.create_layer("Keep").unwrap();
        let before = host.fingerprint();

        let manager = CheckpointManager::new();
        let cp = manager.create(&host, None).await;
        host.create_layer("Scratch").unwrap();

        let outcome = manager.restore(&host, &cp).await;
        assert!(outcome.restored);
        assert_eq!(outcome.strategy, Some(CheckpointStrategy::Snapshot));
        assert_eq!(host.fingerprint(), before);
    }

    #[tokio::test]
    async fn restore_falls_back_to_state_pointer() {
        let host = MemoryHost::with_document("Poster");
        host.create_layer("Keep").unwrap();
        let before = host.fingerprint();

        let manager = CheckpointManager::new();
        let cp = manager.create(&host, None).await;
        host.drop_snapshot(cp.snapshot_name.as_deref().unwrap());
        host.create_layer("Scratch").unwrap();

        let outcome = manager.restore(&host, &cp).await;
        assert!(outcome.restored);
        assert_eq!(outcome.strategy, Some(CheckpointStrategy::StatePointer));
        assert_eq!(host.fingerprint(), before);
    }

    #[tokio::test]
    async fn restore_reports_pruned_state() {
        let host = MemoryHost::with_document("Poster");
        let manager = CheckpointManager::new();
        let cp = manager.create(&host, None).await;
        host.drop_snapshot(cp.snapshot_name.as_deref().unwrap());
        host.prune_states();

        let outcome = manager.restore(&host, &cp).await;
        assert!(!outcome.restored);
        assert!(outcome.detail.contains("pruned"));
    }

    #[tokio::test]
    async fn store_list_and_discard() {
        let host = MemoryHost::with_document("Poster");
        let manager = CheckpointManager::new();
        let a = manager.create(&host, None).await;
        let b = manager.create(&host, None).await;
        assert_eq!(manager.store().list().len(), 2);
        assert!(manager.store().discard(a.id).is_some());
        assert_eq!(manager.store().list().len(), 1);
        assert_eq!(manager.store().list()[0].id, b.id);
    }
}
