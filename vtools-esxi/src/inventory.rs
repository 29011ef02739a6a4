//! In-memory inventory of one host account.
//!
//! The cache holds an immutable [`InventorySnapshot`] behind an `Arc`. A
//! reconciliation builds a complete new snapshot and swaps it in under a
//! short write lock, so readers see either the old or the new inventory,
//! never a mix. Reads clone the `Arc` and never touch the host.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EsxiError, Result};
use crate::types::{Datastore, DatastoreId, Vm, VmId};

/// One complete, immutable view of the host inventory.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    vms: Vec<Vm>,
    vm_index: HashMap<VmId, usize>,
    datastores: Vec<Datastore>,
    datastore_index: HashMap<DatastoreId, usize>,
    reconciled_at: DateTime<Utc>,
}

impl InventorySnapshot {
    /// Build a snapshot from host-reported lists.
    ///
    /// Keeps host order, collapses duplicate ids to their first occurrence
    /// and recomputes every datastore's `vm_ids` from the VM list.
    pub fn build(vms: Vec<Vm>, datastores: Vec<Datastore>) -> Self {
        let mut vm_index = HashMap::with_capacity(vms.len());
        let mut unique_vms = Vec::with_capacity(vms.len());
        for vm in vms {
            if vm_index.contains_key(&vm.id) {
                warn!(vm_id = %vm.id, name = %vm.name, "Host reported duplicate VM id, keeping first record");
                continue;
            }
            vm_index.insert(vm.id.clone(), unique_vms.len());
            unique_vms.push(vm);
        }

        let mut datastore_index = HashMap::with_capacity(datastores.len());
        let mut unique_datastores = Vec::with_capacity(datastores.len());
        for mut ds in datastores {
            if datastore_index.contains_key(&ds.id) {
                warn!(datastore_id = %ds.id, "Host reported duplicate datastore id, keeping first record");
                continue;
            }
            ds.vm_ids.clear();
            datastore_index.insert(ds.id.clone(), unique_datastores.len());
            unique_datastores.push(ds);
        }

        for vm in &unique_vms {
            let Some(ds_id) = &vm.datastore_id else {
                continue;
            };
            match datastore_index.get(ds_id) {
                Some(&idx) => {
                    unique_datastores[idx].vm_ids.insert(vm.id.clone());
                }
                None => {
                    debug!(vm_id = %vm.id, datastore_id = %ds_id, "VM references unknown datastore");
                }
            }
        }

        Self {
            vms: unique_vms,
            vm_index,
            datastores: unique_datastores,
            datastore_index,
            reconciled_at: Utc::now(),
        }
    }

    pub fn vms(&self) -> &[Vm] {
        &self.vms
    }

    pub fn datastores(&self) -> &[Datastore] {
        &self.datastores
    }

    pub fn get_vm(&self, id: &VmId) -> Option<&Vm> {
        self.vm_index.get(id).map(|&idx| &self.vms[idx])
    }

    pub fn contains_vm(&self, id: &VmId) -> bool {
        self.vm_index.contains_key(id)
    }

    pub fn get_datastore(&self, id: &DatastoreId) -> Option<&Datastore> {
        self.datastore_index
            .get(id)
            .map(|&idx| &self.datastores[idx])
    }

    pub fn reconciled_at(&self) -> DateTime<Utc> {
        self.reconciled_at
    }

    fn diff_from(&self, previous: Option<&InventorySnapshot>) -> InventoryDiff {
        let Some(previous) = previous else {
            return InventoryDiff {
                added: self.vms.iter().map(|vm| vm.id.clone()).collect(),
                removed: Vec::new(),
                changed: Vec::new(),
                datastores_changed: !self.datastores.is_empty(),
                initial: true,
            };
        };

        let mut added = Vec::new();
        let mut changed = Vec::new();
        for vm in &self.vms {
            match previous.get_vm(&vm.id) {
                None => added.push(vm.id.clone()),
                Some(old) if old != vm => changed.push(vm.id.clone()),
                Some(_) => {}
            }
        }

        let current: HashSet<&VmId> = self.vm_index.keys().collect();
        let removed = previous
            .vms
            .iter()
            .filter(|vm| !current.contains(&vm.id))
            .map(|vm| vm.id.clone())
            .collect();

        InventoryDiff {
            added,
            removed,
            changed,
            datastores_changed: previous.datastores != self.datastores,
            initial: false,
        }
    }
}

/// What a reconciliation changed, relative to the snapshot it replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventoryDiff {
    pub added: Vec<VmId>,
    pub removed: Vec<VmId>,
    pub changed: Vec<VmId>,
    pub datastores_changed: bool,
    /// First reconciliation of this cache.
    pub initial: bool,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        !self.initial
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && !self.datastores_changed
    }
}

/// Last known VM and datastore records for one host account.
#[derive(Debug, Default)]
pub struct InventoryCache {
    current: RwLock<Option<Arc<InventorySnapshot>>>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, or `NotInitialized` before the first reconciliation.
    pub fn snapshot(&self) -> Result<Arc<InventorySnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EsxiError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_ok()
    }

    pub fn reconciled_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().ok().map(|s| s.reconciled_at())
    }

    pub fn list_vms(&self) -> Result<Vec<Vm>> {
        Ok(self.snapshot()?.vms().to_vec())
    }

    pub fn list_datastores(&self) -> Result<Vec<Datastore>> {
        Ok(self.snapshot()?.datastores().to_vec())
    }

    pub fn get_vm(&self, id: &VmId) -> Result<Vm> {
        self.snapshot()?
            .get_vm(id)
            .cloned()
            .ok_or_else(|| EsxiError::NotFound(id.clone()))
    }

    pub fn get_datastore(&self, id: &DatastoreId) -> Result<Option<Datastore>> {
        Ok(self.snapshot()?.get_datastore(id).cloned())
    }

    /// First VM with exactly this name, in inventory order.
    pub fn find_vm_by_name(&self, name: &str) -> Result<Option<Vm>> {
        Ok(self
            .snapshot()?
            .vms()
            .iter()
            .find(|vm| vm.name == name)
            .cloned())
    }

    pub fn find_datastore_by_name(&self, name: &str) -> Result<Option<Datastore>> {
        Ok(self
            .snapshot()?
            .datastores()
            .iter()
            .find(|ds| ds.name == name)
            .cloned())
    }

    /// VMs matching `predicate`, in inventory order.
    pub fn filter_vms<F>(&self, predicate: F) -> Result<Vec<Vm>>
    where
        F: Fn(&Vm) -> bool,
    {
        Ok(self
            .snapshot()?
            .vms()
            .iter()
            .filter(|vm| predicate(vm))
            .cloned()
            .collect())
    }

    /// Replace the cache contents with a fresh host view.
    pub fn apply_reconciliation(&self, vms: Vec<Vm>, datastores: Vec<Datastore>) -> InventoryDiff {
        self.install(InventorySnapshot::build(vms, datastores)).0
    }

    /// Swap in `snapshot`, returning the diff and the installed view.
    pub(crate) fn install(
        &self,
        snapshot: InventorySnapshot,
    ) -> (InventoryDiff, Arc<InventorySnapshot>) {
        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let diff = snapshot.diff_from(current.as_deref());
        *current = Some(Arc::clone(&snapshot));
        (diff, snapshot)
    }
}
