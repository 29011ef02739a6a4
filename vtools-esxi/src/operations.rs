//! Per-resource operation locks and the history of finished operations.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EsxiError, Result};
use crate::types::{OperationKind, OperationStatus, PendingOperation, VmId};

/// In-flight operations keyed by VM id (or provisional id), plus a bounded
/// ring of finished ones.
#[derive(Debug)]
pub(crate) struct OperationRegistry {
    pending: Mutex<HashMap<String, PendingOperation>>,
    history: Mutex<VecDeque<PendingOperation>>,
    history_capacity: usize,
}

impl OperationRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    /// Atomically check for a conflicting operation on `key` and register a
    /// new one. The returned guard releases the lock when dropped.
    pub fn begin(
        &self,
        key: String,
        target: Option<VmId>,
        kind: OperationKind,
    ) -> Result<PendingGuard<'_>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.entry(key) {
            Entry::Occupied(entry) => Err(EsxiError::AlreadyInProgress {
                key: entry.key().clone(),
                kind: entry.get().kind,
            }),
            Entry::Vacant(entry) => {
                let op = PendingOperation::new(entry.key().clone(), target, kind);
                debug!(key = %op.key, op_id = %op.id, kind = %kind, "Registered pending operation");
                let guard = PendingGuard {
                    registry: self,
                    key: op.key.clone(),
                    op_id: op.id,
                    done: false,
                };
                entry.insert(op);
                Ok(guard)
            }
        }
    }

    pub fn in_flight(&self) -> Vec<PendingOperation> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ops: Vec<_> = pending.values().cloned().collect();
        ops.sort_by_key(|op| op.submitted_at);
        ops
    }

    /// Finished operations, oldest first.
    pub fn recent(&self) -> Vec<PendingOperation> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// In-flight operation targeting `id`, if any.
    pub fn in_flight_for(&self, id: &VmId) -> Option<OperationKind> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(op) = pending.get(id.as_str()) {
            return Some(op.kind);
        }
        pending
            .values()
            .find(|op| op.target.as_ref() == Some(id))
            .map(|op| op.kind)
    }

    fn rekey(&self, key: &str, op_id: Uuid, target: VmId) -> Option<String> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut op) = pending.remove(key).filter(|op| op.id == op_id) else {
            return None;
        };
        op.target = Some(target.clone());

        let new_key = target.to_string();
        if pending.contains_key(&new_key) {
            // Someone locked the id between host answer and rekey; keep ours
            // under the provisional key so both remain visible.
            warn!(key, vm_id = %target, "Host-assigned id already locked, keeping provisional key");
            pending.insert(key.to_string(), op);
            return None;
        }
        op.key = new_key.clone();
        pending.insert(new_key.clone(), op);
        Some(new_key)
    }

    fn finish(&self, key: &str, op_id: Uuid, status: OperationStatus, error: Option<String>) {
        let op = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get(key) {
                Some(op) if op.id == op_id => pending.remove(key),
                _ => None,
            }
        };
        let Some(mut op) = op else {
            return;
        };
        op.status = status;
        op.finished_at = Some(Utc::now());
        op.error = error;

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if self.history_capacity == 0 {
            return;
        }
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(op);
    }
}

/// RAII lock on one resource. Dropping it without calling [`succeed`] or
/// [`fail`] records the operation as cancelled.
///
/// [`succeed`]: PendingGuard::succeed
/// [`fail`]: PendingGuard::fail
#[derive(Debug)]
pub(crate) struct PendingGuard<'a> {
    registry: &'a OperationRegistry,
    key: String,
    op_id: Uuid,
    done: bool,
}

impl PendingGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Move the lock from the provisional key to the host-assigned id.
    pub fn rekey(&mut self, target: VmId) {
        if let Some(new_key) = self.registry.rekey(&self.key, self.op_id, target) {
            self.key = new_key;
        }
    }

    pub fn succeed(mut self) {
        self.done = true;
        self.registry
            .finish(&self.key, self.op_id, OperationStatus::Succeeded, None);
    }

    pub fn fail(mut self, err: &EsxiError) {
        self.done = true;
        self.registry.finish(
            &self.key,
            self.op_id,
            OperationStatus::Failed,
            Some(err.to_string()),
        );
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!(key = %self.key, op_id = %self.op_id, "Pending operation dropped before completion");
            self.registry.finish(
                &self.key,
                self.op_id,
                OperationStatus::Failed,
                Some("cancelled".to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_on_same_key_conflicts() {
        let registry = OperationRegistry::new(8);
        let _guard = registry
            .begin("vm-1".into(), Some(VmId::from("vm-1")), OperationKind::Destroy)
            .unwrap();

        match registry.begin("vm-1".into(), Some(VmId::from("vm-1")), OperationKind::PowerOff) {
            Err(EsxiError::AlreadyInProgress { key, kind }) => {
                assert_eq!(key, "vm-1");
                assert_eq!(kind, OperationKind::Destroy);
            }
            other => panic!("expected AlreadyInProgress, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_and_records_failure() {
        let registry = OperationRegistry::new(8);
        {
            let _guard = registry
                .begin("vm-1".into(), Some(VmId::from("vm-1")), OperationKind::Destroy)
                .unwrap();
            assert_eq!(registry.in_flight().len(), 1);
        }
        assert!(registry.in_flight().is_empty());

        let recent = registry.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, OperationStatus::Failed);
        assert_eq!(recent[0].error.as_deref(), Some("cancelled"));
        assert!(recent[0].finished_at.is_some());

        assert!(
            registry
                .begin("vm-1".into(), None, OperationKind::Destroy)
                .is_ok()
        );
    }

    #[test]
    fn test_rekey_moves_lock_to_host_id() {
        let registry = OperationRegistry::new(8);
        let mut guard = registry
            .begin("provisional-x".into(), None, OperationKind::Create)
            .unwrap();
        guard.rekey(VmId::from("vm-9"));
        assert_eq!(guard.key(), "vm-9");

        assert!(matches!(
            registry.begin("vm-9".into(), None, OperationKind::Destroy),
            Err(EsxiError::AlreadyInProgress { .. })
        ));
        assert_eq!(
            registry.in_flight_for(&VmId::from("vm-9")),
            Some(OperationKind::Create)
        );

        guard.succeed();
        let recent = registry.recent();
        assert_eq!(recent[0].key, "vm-9");
        assert_eq!(recent[0].target, Some(VmId::from("vm-9")));
        assert_eq!(recent[0].status, OperationStatus::Succeeded);
    }

    #[test]
    fn test_rekey_onto_locked_id_keeps_provisional_key() {
        let registry = OperationRegistry::new(8);
        let _other = registry
            .begin("vm-9".into(), Some(VmId::from("vm-9")), OperationKind::Destroy)
            .unwrap();
        let mut guard = registry
            .begin("provisional-y".into(), None, OperationKind::Create)
            .unwrap();

        guard.rekey(VmId::from("vm-9"));

        assert_eq!(guard.key(), "provisional-y");
        assert_eq!(registry.in_flight().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = OperationRegistry::new(2);
        for i in 0..5 {
            registry
                .begin(format!("vm-{i}"), None, OperationKind::PowerOn)
                .unwrap()
                .succeed();
        }
        let keys: Vec<_> = registry.recent().into_iter().map(|op| op.key).collect();
        assert_eq!(keys, vec!["vm-3", "vm-4"]);
    }
}
