//! In-memory host for tests and dry runs.
//!
//! [`MockHost`] keeps a VM, datastore and snapshot list, counts calls, and
//! can inject failures, latency and visibility lag (created VMs hidden and
//! destroyed VMs still listed for a number of reads).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::TransportError;
use crate::transport::HostTransport;
use crate::types::{
    Datastore, DatastoreId, PowerAction, PowerState, Snapshot, Vm, VmId, VmResources, VmSpec,
    VmUpdate,
};

#[derive(Debug, Default)]
struct MockState {
    vms: Vec<Vm>,
    datastores: Vec<Datastore>,
    next_id: u64,
    latency: Option<Duration>,
    visibility_lag: u32,
    /// VM id -> remaining list_vms calls that must not show it yet.
    hidden: HashMap<VmId, u32>,
    /// Destroyed VMs still listed for the given number of reads.
    lingering: HashMap<VmId, (Vm, u32)>,
    fail_list: VecDeque<TransportError>,
    fail_create: VecDeque<TransportError>,
    fail_destroy: VecDeque<TransportError>,
    fail_power: VecDeque<TransportError>,
    fail_reconfigure: VecDeque<TransportError>,
    fail_snapshot: VecDeque<TransportError>,
    /// Errors returned by `create_vm` after the VM has been created.
    fail_after_create: VecDeque<TransportError>,
    snapshots: HashMap<VmId, Vec<Snapshot>>,
    next_snapshot: u64,
}

#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockState>,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    power_calls: AtomicUsize,
    reconfigure_calls: AtomicUsize,
    snapshot_calls: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    // === Setup ===

    pub fn add_datastore(&self, datastore: Datastore) {
        self.state().datastores.push(datastore);
    }

    /// Register a VM directly on the host, bypassing lag and counters.
    pub fn add_vm(&self, name: &str, datastore_id: &str, power_state: PowerState) -> VmId {
        let mut state = self.state();
        state.next_id += 1;
        let id = VmId::new(format!("vm-{}", state.next_id));
        state.vms.push(Vm {
            id: id.clone(),
            name: name.to_string(),
            power_state,
            datastore_id: Some(DatastoreId::from(datastore_id)),
            resources: VmResources {
                cpu_count: 1,
                memory_mb: 1024,
                disk_gb: None,
            },
            guest_id: Some("otherGuest".to_string()),
            annotation: None,
        });
        id
    }

    /// Remove a VM behind the core's back.
    pub fn remove_vm(&self, id: &VmId) {
        self.state().vms.retain(|vm| &vm.id != id);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Hide mutations from the next `reads` VM listings.
    pub fn set_visibility_lag(&self, reads: u32) {
        self.state().visibility_lag = reads;
    }

    pub fn fail_next_list(&self, err: TransportError) {
        self.state().fail_list.push_back(err);
    }

    pub fn fail_next_create(&self, err: TransportError) {
        self.state().fail_create.push_back(err);
    }

    pub fn fail_next_destroy(&self, err: TransportError) {
        self.state().fail_destroy.push_back(err);
    }

    pub fn fail_next_power(&self, err: TransportError) {
        self.state().fail_power.push_back(err);
    }

    pub fn fail_next_reconfigure(&self, err: TransportError) {
        self.state().fail_reconfigure.push_back(err);
    }

    /// Fail the next snapshot create or destroy.
    pub fn fail_next_snapshot(&self, err: TransportError) {
        self.state().fail_snapshot.push_back(err);
    }

    /// Let the next create take effect on the host, then answer with `err`.
    pub fn fail_next_create_after_commit(&self, err: TransportError) {
        self.state().fail_after_create.push_back(err);
    }

    // === Inspection ===

    pub fn vm(&self, id: &VmId) -> Option<Vm> {
        self.state().vms.iter().find(|vm| &vm.id == id).cloned()
    }

    pub fn vm_count(&self) -> usize {
        self.state().vms.len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn power_calls(&self) -> usize {
        self.power_calls.load(Ordering::SeqCst)
    }

    pub fn reconfigure_calls(&self) -> usize {
        self.reconfigure_calls.load(Ordering::SeqCst)
    }

    /// Snapshot creates and destroys; listings are not counted.
    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self, id: &VmId) -> Vec<Snapshot> {
        self.state().snapshots.get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HostTransport for MockHost {
    async fn list_vms(&self) -> Result<Vec<Vm>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_list.pop_front() {
            return Err(err);
        }

        let mut vms: Vec<Vm> = state
            .vms
            .iter()
            .filter(|vm| !state.hidden.contains_key(&vm.id))
            .cloned()
            .collect();
        vms.extend(state.lingering.values().map(|(vm, _)| vm.clone()));

        state.hidden.retain(|_, reads| {
            *reads -= 1;
            *reads > 0
        });
        state.lingering.retain(|_, (_, reads)| {
            *reads -= 1;
            *reads > 0
        });
        Ok(vms)
    }

    async fn list_datastores(&self) -> Result<Vec<Datastore>, TransportError> {
        self.delay().await;
        Ok(self.state().datastores.clone())
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<VmId, TransportError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_create.pop_front() {
            return Err(err);
        }
        if !state.datastores.iter().any(|ds| ds.id == spec.datastore_id) {
            return Err(TransportError::rejected(
                400,
                format!("datastore {} does not exist", spec.datastore_id),
            ));
        }

        state.next_id += 1;
        let id = VmId::new(format!("vm-{}", state.next_id));
        state.vms.push(Vm {
            id: id.clone(),
            name: spec.name.clone(),
            power_state: if spec.power_on {
                PowerState::Running
            } else {
                PowerState::Stopped
            },
            datastore_id: Some(spec.datastore_id.clone()),
            resources: spec.resources,
            guest_id: Some(spec.guest_id.clone()),
            annotation: spec.annotation.clone(),
        });
        if state.visibility_lag > 0 {
            let lag = state.visibility_lag;
            state.hidden.insert(id.clone(), lag);
        }
        if let Some(err) = state.fail_after_create.pop_front() {
            return Err(err);
        }
        Ok(id)
    }

    async fn destroy_vm(&self, id: &VmId) -> Result<(), TransportError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_destroy.pop_front() {
            return Err(err);
        }
        let Some(pos) = state.vms.iter().position(|vm| &vm.id == id) else {
            return Err(TransportError::not_found(format!("vm {id}")));
        };
        let vm = state.vms.remove(pos);
        state.snapshots.remove(id);
        if state.visibility_lag > 0 {
            let lag = state.visibility_lag;
            state.lingering.insert(id.clone(), (vm, lag));
        }
        Ok(())
    }

    async fn set_power_state(&self, id: &VmId, action: PowerAction) -> Result<(), TransportError> {
        self.power_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_power.pop_front() {
            return Err(err);
        }
        let Some(vm) = state.vms.iter_mut().find(|vm| &vm.id == id) else {
            return Err(TransportError::not_found(format!("vm {id}")));
        };
        if action == PowerAction::Suspend && vm.power_state != PowerState::Running {
            return Err(TransportError::rejected(
                409,
                "only a running VM can be suspended",
            ));
        }
        vm.power_state = action.target_state();
        Ok(())
    }

    async fn reconfigure_vm(&self, id: &VmId, update: &VmUpdate) -> Result<(), TransportError> {
        self.reconfigure_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_reconfigure.pop_front() {
            return Err(err);
        }
        let Some(vm) = state.vms.iter_mut().find(|vm| &vm.id == id) else {
            return Err(TransportError::not_found(format!("vm {id}")));
        };
        update.apply(vm);
        Ok(())
    }

    async fn list_snapshots(&self, id: &VmId) -> Result<Vec<Snapshot>, TransportError> {
        self.delay().await;

        let state = self.state();
        if !state.vms.iter().any(|vm| &vm.id == id) {
            return Err(TransportError::not_found(format!("vm {id}")));
        }
        Ok(state.snapshots.get(id).cloned().unwrap_or_default())
    }

    async fn create_snapshot(
        &self,
        id: &VmId,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, TransportError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_snapshot.pop_front() {
            return Err(err);
        }
        if !state.vms.iter().any(|vm| &vm.id == id) {
            return Err(TransportError::not_found(format!("vm {id}")));
        }
        state.next_snapshot += 1;
        let snapshot_id = format!("snapshot-{}", state.next_snapshot);
        state.snapshots.entry(id.clone()).or_default().push(Snapshot {
            id: snapshot_id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: Some(Utc::now()),
        });
        Ok(snapshot_id)
    }

    async fn destroy_snapshot(&self, id: &VmId, snapshot_id: &str) -> Result<(), TransportError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.fail_snapshot.pop_front() {
            return Err(err);
        }
        let Some(snapshots) = state.snapshots.get_mut(id) else {
            return Err(TransportError::not_found(format!("vm {id} has no snapshots")));
        };
        let before = snapshots.len();
        snapshots.retain(|s| s.id != snapshot_id);
        if snapshots.len() == before {
            return Err(TransportError::not_found(format!("snapshot {snapshot_id}")));
        }
        Ok(())
    }
}
