//! VM lifecycle manager.
//!
//! Serializes mutations per resource through [`OperationRegistry`], drives
//! them through the [`HostTransport`] and refreshes the [`InventoryCache`]
//! until the host reflects the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audit::EsxiAuditLogger;
use crate::error::{EsxiError, Result, TransportError, TransportErrorKind};
use crate::inventory::{InventoryCache, InventoryDiff, InventorySnapshot};
use crate::operations::OperationRegistry;
use crate::transport::HostTransport;
use crate::types::{
    OperationKind, PendingOperation, PowerAction, PowerState, Snapshot, Vm, VmId, VmSpec, VmUpdate,
    provisional_key,
};

/// Tuning for confirmation reads and operation history.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Inventory reads after a successful mutation before giving up.
    pub confirm_attempts: u32,
    /// Pause between confirmation reads.
    pub confirm_interval: Duration,
    /// Finished operations kept for [`ResourceLifecycleManager::recent_operations`].
    pub history_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            confirm_attempts: 3,
            confirm_interval: Duration::from_millis(500),
            history_capacity: 64,
        }
    }
}

pub struct ResourceLifecycleManager {
    transport: Arc<dyn HostTransport>,
    cache: Arc<InventoryCache>,
    operations: OperationRegistry,
    config: LifecycleConfig,
    audit: EsxiAuditLogger,
}

impl ResourceLifecycleManager {
    pub fn new(
        transport: Arc<dyn HostTransport>,
        cache: Arc<InventoryCache>,
        config: LifecycleConfig,
        audit: EsxiAuditLogger,
    ) -> Self {
        Self {
            transport,
            cache,
            operations: OperationRegistry::new(config.history_capacity),
            config,
            audit,
        }
    }

    pub fn cache(&self) -> &Arc<InventoryCache> {
        &self.cache
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Refresh the cache from the host.
    pub async fn reconcile(&self) -> Result<InventoryDiff> {
        self.refresh()
            .await
            .map(|(diff, _)| diff)
            .map_err(|source| confirm_error(OperationKind::Reconcile, None, source))
    }

    async fn refresh(
        &self,
    ) -> std::result::Result<(InventoryDiff, Arc<InventorySnapshot>), TransportError> {
        let (vms, datastores) = tokio::try_join!(
            self.transport.list_vms(),
            self.transport.list_datastores()
        )?;
        let (diff, snapshot) = self.cache.install(InventorySnapshot::build(vms, datastores));

        if diff.is_empty() {
            debug!(vms = snapshot.vms().len(), "Inventory unchanged");
        } else {
            info!(
                vms = snapshot.vms().len(),
                datastores = snapshot.datastores().len(),
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                "Inventory reconciled"
            );
        }
        Ok((diff, snapshot))
    }

    /// Re-read inventory until `check` holds or attempts run out. The
    /// mutating call that preceded this is never repeated.
    async fn confirm<F>(
        &self,
        operation: OperationKind,
        vm_id: &VmId,
        check: F,
    ) -> Result<Arc<InventorySnapshot>>
    where
        F: Fn(&InventorySnapshot) -> bool,
    {
        let attempts = self.config.confirm_attempts.max(1);
        for attempt in 1..=attempts {
            let (_, snapshot) = self
                .refresh()
                .await
                .map_err(|source| confirm_error(operation, Some(vm_id.clone()), source))?;
            if check(&snapshot) {
                return Ok(snapshot);
            }
            debug!(%vm_id, %operation, attempt, attempts, "Host has not caught up yet");
            if attempt < attempts {
                tokio::time::sleep(self.config.confirm_interval).await;
            }
        }

        Err(EsxiError::Transport {
            operation,
            vm_id: Some(vm_id.clone()),
            source: TransportError::unconfirmed(format!(
                "result not visible after {} inventory reads",
                attempts
            )),
        })
    }

    fn validate(&self, spec: &VmSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(EsxiError::InvalidSpec("name must not be empty".into()));
        }
        if spec.resources.cpu_count == 0 {
            return Err(EsxiError::InvalidSpec("cpu_count must be positive".into()));
        }
        if spec.resources.memory_mb == 0 {
            return Err(EsxiError::InvalidSpec("memory_mb must be positive".into()));
        }
        if spec.resources.disk_gb == Some(0) {
            return Err(EsxiError::InvalidSpec("disk_gb must be positive".into()));
        }

        let snapshot = self.cache.snapshot()?;
        if snapshot.get_datastore(&spec.datastore_id).is_none() {
            return Err(EsxiError::InvalidSpec(format!(
                "datastore {} not found",
                spec.datastore_id
            )));
        }
        Ok(())
    }

    /// Create a VM and wait until the host reports it.
    pub async fn create_vm(&self, spec: VmSpec) -> Result<Vm> {
        self.validate(&spec)?;

        let mut guard = self
            .operations
            .begin(provisional_key(), None, OperationKind::Create)?;
        info!(name = %spec.name, datastore_id = %spec.datastore_id, key = guard.key(), "Creating VM");

        let vm_id = match self.transport.create_vm(&spec).await {
            Ok(id) => id,
            Err(source) => {
                let err = EsxiError::from_transport(OperationKind::Create, None, source, |source| {
                    EsxiError::CreateFailed {
                        name: spec.name.clone(),
                        source,
                    }
                });
                warn!(name = %spec.name, error = %err, "VM create failed");
                self.audit.vm_create_failed(&spec.name, &err.to_string());
                guard.fail(&err);
                return Err(err);
            }
        };
        guard.rekey(vm_id.clone());
        debug!(name = %spec.name, %vm_id, "Host accepted create");

        let snapshot = match self
            .confirm(OperationKind::Create, &vm_id, |s| s.contains_vm(&vm_id))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(name = %spec.name, %vm_id, error = %err, "VM create not confirmed");
                guard.fail(&err);
                return Err(err);
            }
        };

        let Some(vm) = snapshot.get_vm(&vm_id).cloned() else {
            let err = EsxiError::NotFound(vm_id);
            guard.fail(&err);
            return Err(err);
        };
        if !vm.matches_spec(&spec) {
            warn!(%vm_id, name = %vm.name, "Created VM differs from requested spec");
        }

        guard.succeed();
        self.audit.vm_created(&vm.id, &vm.name);
        info!(%vm_id, name = %vm.name, state = %vm.power_state, "VM created");
        Ok(vm)
    }

    /// Destroy a VM and wait until the host no longer reports it.
    ///
    /// On failure the cached record is left as it was.
    pub async fn destroy_vm(&self, id: &VmId) -> Result<()> {
        let vm = self.cache.get_vm(id)?;
        let guard = self
            .operations
            .begin(id.to_string(), Some(id.clone()), OperationKind::Destroy)?;
        info!(vm_id = %id, name = %vm.name, "Destroying VM");

        if let Err(source) = self.transport.destroy_vm(id).await {
            let err = EsxiError::from_transport(
                OperationKind::Destroy,
                Some(id.clone()),
                source,
                |source| EsxiError::DestroyFailed {
                    vm_id: id.clone(),
                    source,
                },
            );
            warn!(vm_id = %id, error = %err, "VM destroy failed");
            self.audit.vm_destroy_failed(id, &err.to_string());
            guard.fail(&err);
            return Err(err);
        }

        match self
            .confirm(OperationKind::Destroy, id, |s| !s.contains_vm(id))
            .await
        {
            Ok(_) => {
                guard.succeed();
                self.audit.vm_destroyed(id, &vm.name);
                info!(vm_id = %id, name = %vm.name, "VM destroyed");
                Ok(())
            }
            Err(err) => {
                warn!(vm_id = %id, error = %err, "VM destroy not confirmed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    pub async fn power_on(&self, id: &VmId) -> Result<Vm> {
        self.set_power(id, PowerAction::On).await
    }

    pub async fn power_off(&self, id: &VmId) -> Result<Vm> {
        self.set_power(id, PowerAction::Off).await
    }

    pub async fn suspend(&self, id: &VmId) -> Result<Vm> {
        self.set_power(id, PowerAction::Suspend).await
    }

    async fn set_power(&self, id: &VmId, action: PowerAction) -> Result<Vm> {
        let operation = action.operation();
        let target = action.target_state();
        let vm = self.cache.get_vm(id)?;
        let guard = self
            .operations
            .begin(id.to_string(), Some(id.clone()), operation)?;

        if vm.power_state == target {
            debug!(vm_id = %id, state = %target, "VM already in requested power state");
            guard.succeed();
            return Ok(vm);
        }
        info!(vm_id = %id, name = %vm.name, %operation, "Changing VM power state");

        if let Err(source) = self.transport.set_power_state(id, action).await {
            let err = EsxiError::from_transport(operation, Some(id.clone()), source, |source| {
                EsxiError::PowerFailed {
                    vm_id: id.clone(),
                    operation,
                    source,
                }
            });
            warn!(vm_id = %id, error = %err, "VM power change failed");
            self.audit.vm_power_failed(id, action, &err.to_string());
            guard.fail(&err);
            return Err(err);
        }

        let confirmed = self
            .confirm(operation, id, |s| {
                s.get_vm(id).is_some_and(|vm| vm.power_state == target)
            })
            .await;
        match confirmed.map(|s| s.get_vm(id).cloned()) {
            Ok(Some(vm)) => {
                guard.succeed();
                self.audit.vm_power_changed(id, action);
                Ok(vm)
            }
            Ok(None) => {
                let err = EsxiError::NotFound(id.clone());
                guard.fail(&err);
                Err(err)
            }
            Err(err) => {
                warn!(vm_id = %id, error = %err, "VM power change not confirmed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    /// Change name, sizing, guest id or notes of a VM and wait until the
    /// host reports the new name and sizing.
    pub async fn reconfigure_vm(&self, id: &VmId, update: VmUpdate) -> Result<Vm> {
        validate_update(&update)?;
        let vm = self.cache.get_vm(id)?;
        let guard = self
            .operations
            .begin(id.to_string(), Some(id.clone()), OperationKind::Reconfigure)?;
        info!(vm_id = %id, name = %vm.name, "Reconfiguring VM");

        if let Err(source) = self.transport.reconfigure_vm(id, &update).await {
            let err = EsxiError::from_transport(
                OperationKind::Reconfigure,
                Some(id.clone()),
                source,
                |source| EsxiError::ReconfigureFailed {
                    vm_id: id.clone(),
                    source,
                },
            );
            warn!(vm_id = %id, error = %err, "VM reconfigure failed");
            self.audit.vm_reconfigure_failed(id, &err.to_string());
            guard.fail(&err);
            return Err(err);
        }

        let confirmed = self
            .confirm(OperationKind::Reconfigure, id, |s| {
                s.get_vm(id).is_some_and(|vm| update.is_reflected_in(vm))
            })
            .await;
        match confirmed.map(|s| s.get_vm(id).cloned()) {
            Ok(Some(vm)) => {
                guard.succeed();
                self.audit.vm_reconfigured(id, &vm.name);
                info!(vm_id = %id, name = %vm.name, "VM reconfigured");
                Ok(vm)
            }
            Ok(None) => {
                let err = EsxiError::NotFound(id.clone());
                guard.fail(&err);
                Err(err)
            }
            Err(err) => {
                warn!(vm_id = %id, error = %err, "VM reconfigure not confirmed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    /// Snapshots of a cached VM, read from the host.
    pub async fn list_snapshots(&self, id: &VmId) -> Result<Vec<Snapshot>> {
        self.cache.get_vm(id)?;
        self.read_snapshots(OperationKind::SnapshotList, id).await
    }

    async fn read_snapshots(&self, operation: OperationKind, id: &VmId) -> Result<Vec<Snapshot>> {
        self.transport
            .list_snapshots(id)
            .await
            .map_err(|source| match source.kind {
                TransportErrorKind::NotFound => EsxiError::NotFound(id.clone()),
                _ => confirm_error(operation, Some(id.clone()), source),
            })
    }

    /// Like [`confirm`](Self::confirm), over the snapshot list of one VM.
    async fn confirm_snapshots<F>(
        &self,
        operation: OperationKind,
        vm_id: &VmId,
        check: F,
    ) -> Result<Vec<Snapshot>>
    where
        F: Fn(&[Snapshot]) -> bool,
    {
        let attempts = self.config.confirm_attempts.max(1);
        for attempt in 1..=attempts {
            let snapshots = self.read_snapshots(operation, vm_id).await?;
            if check(snapshots.as_slice()) {
                return Ok(snapshots);
            }
            debug!(%vm_id, %operation, attempt, attempts, "Snapshot list has not caught up yet");
            if attempt < attempts {
                tokio::time::sleep(self.config.confirm_interval).await;
            }
        }

        Err(EsxiError::Transport {
            operation,
            vm_id: Some(vm_id.clone()),
            source: TransportError::unconfirmed(format!(
                "snapshot change not visible after {} reads",
                attempts
            )),
        })
    }

    /// Take a snapshot of a VM and wait until the host lists it.
    pub async fn create_snapshot(
        &self,
        id: &VmId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Snapshot> {
        if name.trim().is_empty() {
            return Err(EsxiError::InvalidSpec(
                "snapshot name must not be empty".into(),
            ));
        }
        self.cache.get_vm(id)?;
        let guard = self
            .operations
            .begin(id.to_string(), Some(id.clone()), OperationKind::SnapshotCreate)?;
        info!(vm_id = %id, snapshot = name, "Creating snapshot");

        let snapshot_id = match self.transport.create_snapshot(id, name, description).await {
            Ok(snapshot_id) => snapshot_id,
            Err(source) => {
                let err = EsxiError::from_transport(
                    OperationKind::SnapshotCreate,
                    Some(id.clone()),
                    source,
                    |source| EsxiError::SnapshotFailed {
                        vm_id: id.clone(),
                        operation: OperationKind::SnapshotCreate,
                        source,
                    },
                );
                warn!(vm_id = %id, snapshot = name, error = %err, "Snapshot create failed");
                self.audit
                    .snapshot_failed(id, OperationKind::SnapshotCreate, &err.to_string());
                guard.fail(&err);
                return Err(err);
            }
        };

        let confirmed = self
            .confirm_snapshots(OperationKind::SnapshotCreate, id, |list| {
                list.iter().any(|s| s.id == snapshot_id)
            })
            .await
            .map(|list| list.into_iter().find(|s| s.id == snapshot_id));
        match confirmed {
            Ok(Some(snapshot)) => {
                guard.succeed();
                self.audit.snapshot_created(id, &snapshot.id, &snapshot.name);
                info!(vm_id = %id, snapshot_id = %snapshot.id, "Snapshot created");
                Ok(snapshot)
            }
            Ok(None) => {
                let err = EsxiError::SnapshotNotFound {
                    vm_id: id.clone(),
                    name: name.to_string(),
                };
                guard.fail(&err);
                Err(err)
            }
            Err(err) => {
                warn!(vm_id = %id, error = %err, "Snapshot create not confirmed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    /// Remove a snapshot, addressed by id or by its unique name.
    pub async fn destroy_snapshot(&self, id: &VmId, name_or_id: &str) -> Result<()> {
        self.cache.get_vm(id)?;
        let guard = self
            .operations
            .begin(id.to_string(), Some(id.clone()), OperationKind::SnapshotDestroy)?;

        let snapshot = match self
            .read_snapshots(OperationKind::SnapshotDestroy, id)
            .await
            .and_then(|list| select_snapshot(id, list, name_or_id))
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                guard.fail(&err);
                return Err(err);
            }
        };
        info!(vm_id = %id, snapshot_id = %snapshot.id, name = %snapshot.name, "Destroying snapshot");

        if let Err(source) = self.transport.destroy_snapshot(id, &snapshot.id).await {
            let err = EsxiError::from_transport(
                OperationKind::SnapshotDestroy,
                Some(id.clone()),
                source,
                |source| EsxiError::SnapshotFailed {
                    vm_id: id.clone(),
                    operation: OperationKind::SnapshotDestroy,
                    source,
                },
            );
            warn!(vm_id = %id, snapshot_id = %snapshot.id, error = %err, "Snapshot destroy failed");
            self.audit
                .snapshot_failed(id, OperationKind::SnapshotDestroy, &err.to_string());
            guard.fail(&err);
            return Err(err);
        }

        match self
            .confirm_snapshots(OperationKind::SnapshotDestroy, id, |list| {
                !list.iter().any(|s| s.id == snapshot.id)
            })
            .await
        {
            Ok(_) => {
                guard.succeed();
                self.audit.snapshot_destroyed(id, &snapshot.id, &snapshot.name);
                info!(vm_id = %id, snapshot_id = %snapshot.id, "Snapshot destroyed");
                Ok(())
            }
            Err(err) => {
                warn!(vm_id = %id, error = %err, "Snapshot destroy not confirmed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    /// Replace host-reported states with `Creating` / `Deleting` for VMs
    /// that have a create or destroy in flight.
    pub fn overlay(&self, mut vms: Vec<Vm>) -> Vec<Vm> {
        let in_flight: HashMap<VmId, OperationKind> = self
            .operations
            .in_flight()
            .into_iter()
            .filter_map(|op| op.target.map(|target| (target, op.kind)))
            .collect();
        if in_flight.is_empty() {
            return vms;
        }
        for vm in &mut vms {
            match in_flight.get(&vm.id) {
                Some(OperationKind::Destroy) => vm.power_state = PowerState::Deleting,
                Some(OperationKind::Create) => vm.power_state = PowerState::Creating,
                _ => {}
            }
        }
        vms
    }

    pub fn overlay_vm(&self, vm: Vm) -> Vm {
        match self.operations.in_flight_for(&vm.id) {
            Some(OperationKind::Destroy) => Vm {
                power_state: PowerState::Deleting,
                ..vm
            },
            Some(OperationKind::Create) => Vm {
                power_state: PowerState::Creating,
                ..vm
            },
            _ => vm,
        }
    }

    /// In-flight operations, oldest first.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.operations.in_flight()
    }

    /// Finished operations, oldest first.
    pub fn recent_operations(&self) -> Vec<PendingOperation> {
        self.operations.recent()
    }
}

fn validate_update(update: &VmUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(EsxiError::InvalidSpec("nothing to change".into()));
    }
    if update.name.as_ref().is_some_and(|name| name.trim().is_empty()) {
        return Err(EsxiError::InvalidSpec("name must not be empty".into()));
    }
    if update.cpu_count == Some(0) {
        return Err(EsxiError::InvalidSpec("cpu_count must be positive".into()));
    }
    if update.memory_mb == Some(0) {
        return Err(EsxiError::InvalidSpec("memory_mb must be positive".into()));
    }
    Ok(())
}

/// An exact id match wins; otherwise the name must be unique.
fn select_snapshot(vm_id: &VmId, snapshots: Vec<Snapshot>, name_or_id: &str) -> Result<Snapshot> {
    if let Some(snapshot) = snapshots.iter().find(|s| s.id == name_or_id) {
        return Ok(snapshot.clone());
    }
    let mut named = snapshots.into_iter().filter(|s| s.name == name_or_id);
    match (named.next(), named.next()) {
        (Some(snapshot), None) => Ok(snapshot),
        (Some(_), Some(_)) => Err(EsxiError::InvalidSpec(format!(
            "several snapshots named '{}', pass the snapshot id",
            name_or_id
        ))),
        (None, _) => Err(EsxiError::SnapshotNotFound {
            vm_id: vm_id.clone(),
            name: name_or_id.to_string(),
        }),
    }
}

fn confirm_error(operation: OperationKind, vm_id: Option<VmId>, source: TransportError) -> EsxiError {
    if source.kind == TransportErrorKind::Cancelled {
        EsxiError::Cancelled { operation, vm_id }
    } else {
        EsxiError::Transport {
            operation,
            vm_id,
            source,
        }
    }
}
