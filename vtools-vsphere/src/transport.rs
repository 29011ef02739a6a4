//! [`HostTransport`] implementation on top of the vSphere REST API.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};
use vtools_esxi::{
    AccountIdentity, Datastore, DatastoreId, HostTransport, PowerAction, Snapshot, TransportError,
    Vm, VmId, VmResources, VmSpec, VmUpdate,
};

use crate::client::VsphereClient;
use crate::error::{Result, VsphereError};
use crate::types::{
    DatastoreSummary, NewVmdkSpec, PlacementConfig, SnapshotCreateSpec, SnapshotSummary,
    VmCpuSpec, VmCpuUpdate, VmCreateSpec, VmDiskSpec, VmInfo, VmMemorySpec, VmMemoryUpdate,
    VmPlacementSpec, VmSummary, VsphereConfig, WirePowerState, datastore_name_from_vmdk,
};

/// Parallel `GET /api/vcenter/vm/{vm}` requests during a listing.
const DETAIL_CONCURRENCY: usize = 8;

const GIB: u64 = 1024 * 1024 * 1024;

pub struct VsphereTransport {
    client: VsphereClient,
    identity: AccountIdentity,
    placement: PlacementConfig,
}

impl VsphereTransport {
    pub fn new(config: &VsphereConfig) -> Result<Self> {
        Ok(Self {
            client: VsphereClient::new(config)?,
            identity: AccountIdentity::new(config.endpoint(), config.username.clone()),
            placement: config.placement.clone(),
        })
    }

    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    pub fn client(&self) -> &VsphereClient {
        &self.client
    }

    async fn datastore_summaries(&self) -> Result<Vec<DatastoreSummary>> {
        self.client.get("/api/vcenter/datastore").await
    }

    /// Detail one VM. `None` when it vanished after the listing.
    async fn vm_detail(
        &self,
        summary: VmSummary,
        datastore_ids: &HashMap<String, DatastoreId>,
    ) -> Result<Option<Vm>> {
        let info: VmInfo = match self
            .client
            .get(&format!("/api/vcenter/vm/{}", summary.vm))
            .await
        {
            Ok(info) => info,
            Err(VsphereError::NotFound(_)) => {
                debug!(vm_id = %summary.vm, "VM disappeared during listing");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let primary_disk = info.primary_disk();
        let datastore_id = primary_disk
            .and_then(|disk| disk.backing.as_ref())
            .and_then(|backing| backing.vmdk_file.as_deref())
            .and_then(datastore_name_from_vmdk)
            .and_then(|name| datastore_ids.get(name).cloned());
        let disk_gb = primary_disk
            .and_then(|disk| disk.capacity)
            .map(|bytes| bytes.div_ceil(GIB));

        Ok(Some(Vm {
            id: VmId::new(summary.vm),
            name: info.name,
            power_state: info.power_state.into(),
            datastore_id,
            resources: VmResources {
                cpu_count: info
                    .cpu
                    .map(|cpu| cpu.count)
                    .or(summary.cpu_count)
                    .unwrap_or(0),
                memory_mb: info
                    .memory
                    .map(|mem| mem.size_mib)
                    .or(summary.memory_size_mib)
                    .unwrap_or(0),
                disk_gb,
            },
            guest_id: info.guest_os,
            annotation: None,
        }))
    }

    fn create_spec(&self, spec: &VmSpec) -> VmCreateSpec {
        VmCreateSpec {
            name: spec.name.clone(),
            guest_os: wire_guest_os(&spec.guest_id),
            placement: VmPlacementSpec {
                datastore: spec.datastore_id.to_string(),
                folder: self.placement.folder.clone(),
                resource_pool: self.placement.resource_pool.clone(),
                host: self.placement.host.clone(),
            },
            cpu: VmCpuSpec {
                count: spec.resources.cpu_count,
            },
            memory: VmMemorySpec {
                size_mib: spec.resources.memory_mb,
            },
            disks: spec
                .resources
                .disk_gb
                .map(|gb| VmDiskSpec {
                    new_vmdk: NewVmdkSpec {
                        capacity: gb * GIB,
                    },
                })
                .into_iter()
                .collect(),
        }
    }

    async fn power(&self, id: &str, action: &str) -> Result<()> {
        self.client
            .post_empty(&format!("/api/vcenter/vm/{id}/power?action={action}"))
            .await
    }
}

/// A follow-up request failed after an earlier one already changed the VM.
/// The host is no longer in its prior state, so the failure is ambiguous.
fn partial_failure(done: &str, err: VsphereError) -> TransportError {
    TransportError::unconfirmed(format!("{done}, then: {err}"))
}

/// Update fields the REST API cannot change.
fn unsupported_fields(update: &VmUpdate) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if update.name.is_some() {
        fields.push("name");
    }
    if update.guest_id.is_some() {
        fields.push("guest id");
    }
    if update.annotation.is_some() {
        fields.push("annotation");
    }
    fields
}

fn into_snapshot(summary: SnapshotSummary) -> Snapshot {
    Snapshot {
        name: summary.name.unwrap_or_else(|| summary.snapshot.clone()),
        id: summary.snapshot,
        description: summary.description,
        created_at: summary.creation_time,
    }
}

/// Map the generic guest id onto the REST enum; anything else is passed
/// through as a vSphere guest identifier.
fn wire_guest_os(guest_id: &str) -> String {
    match guest_id {
        "otherGuest" => "OTHER".to_string(),
        "otherGuest64" => "OTHER_64".to_string(),
        other => other.to_string(),
    }
}

fn into_datastore(summary: DatastoreSummary) -> Datastore {
    Datastore {
        id: DatastoreId::new(summary.datastore),
        name: summary.name,
        kind: summary.ds_type,
        capacity_bytes: summary.capacity.unwrap_or(0),
        free_space_bytes: summary.free_space.unwrap_or(0),
        vm_ids: Default::default(),
    }
}

#[async_trait]
impl HostTransport for VsphereTransport {
    async fn list_vms(&self) -> std::result::Result<Vec<Vm>, TransportError> {
        let (summaries, datastores) = tokio::try_join!(
            self.client.get::<Vec<VmSummary>>("/api/vcenter/vm"),
            self.datastore_summaries()
        )?;
        let datastore_ids: HashMap<String, DatastoreId> = datastores
            .into_iter()
            .map(|ds| (ds.name, DatastoreId::new(ds.datastore)))
            .collect();

        let vms: Vec<Option<Vm>> = stream::iter(summaries)
            .map(|summary| self.vm_detail(summary, &datastore_ids))
            .buffered(DETAIL_CONCURRENCY)
            .try_collect()
            .await?;
        let vms: Vec<Vm> = vms.into_iter().flatten().collect();
        debug!(count = vms.len(), "Listed VMs");
        Ok(vms)
    }

    async fn list_datastores(&self) -> std::result::Result<Vec<Datastore>, TransportError> {
        let summaries = self.datastore_summaries().await?;
        debug!(count = summaries.len(), "Listed datastores");
        Ok(summaries.into_iter().map(into_datastore).collect())
    }

    async fn create_vm(&self, spec: &VmSpec) -> std::result::Result<VmId, TransportError> {
        let body = self.create_spec(spec);
        let id: String = self.client.post("/api/vcenter/vm", &body).await?;
        info!(vm_id = %id, name = %spec.name, "VM created on host");

        if spec.power_on {
            // The VM exists at this point; report a power-on failure as a
            // stopped VM rather than a failed create.
            if let Err(e) = self.power(&id, "start").await {
                warn!(vm_id = %id, error = %e, "Power on after create failed");
            }
        }
        Ok(VmId::new(id))
    }

    async fn destroy_vm(&self, id: &VmId) -> std::result::Result<(), TransportError> {
        let info: VmInfo = self
            .client
            .get(&format!("/api/vcenter/vm/{id}"))
            .await?;
        let stopped = info.power_state == WirePowerState::PoweredOn;
        if stopped {
            debug!(vm_id = %id, "Stopping VM before delete");
            self.power(id.as_str(), "stop").await?;
        }

        match self.client.delete(&format!("/api/vcenter/vm/{id}")).await {
            Ok(()) => {
                info!(vm_id = %id, "VM deleted on host");
                Ok(())
            }
            Err(e) if stopped => {
                warn!(vm_id = %id, error = %e, "Delete failed after the VM was stopped");
                Err(partial_failure("VM was powered off for deletion", e))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconfigure_vm(
        &self,
        id: &VmId,
        update: &VmUpdate,
    ) -> std::result::Result<(), TransportError> {
        let unsupported = unsupported_fields(update);
        if !unsupported.is_empty() {
            return Err(TransportError::rejected(
                501,
                format!(
                    "{} cannot be changed through the vSphere REST API",
                    unsupported.join(", ")
                ),
            ));
        }

        let mut changed = false;
        if let Some(count) = update.cpu_count {
            self.client
                .patch(
                    &format!("/api/vcenter/vm/{id}/hardware/cpu"),
                    &VmCpuUpdate { count },
                )
                .await?;
            changed = true;
        }
        if let Some(size_mib) = update.memory_mb {
            let result = self
                .client
                .patch(
                    &format!("/api/vcenter/vm/{id}/hardware/memory"),
                    &VmMemoryUpdate { size_mib },
                )
                .await;
            match result {
                Ok(()) => {}
                Err(e) if changed => return Err(partial_failure("CPU count was changed", e)),
                Err(e) => return Err(e.into()),
            }
        }
        info!(vm_id = %id, "VM reconfigured on host");
        Ok(())
    }

    async fn list_snapshots(&self, id: &VmId) -> std::result::Result<Vec<Snapshot>, TransportError> {
        let summaries: Vec<SnapshotSummary> = self
            .client
            .get(&format!("/api/vcenter/vm/{id}/snapshots"))
            .await?;
        Ok(summaries.into_iter().map(into_snapshot).collect())
    }

    async fn create_snapshot(
        &self,
        id: &VmId,
        name: &str,
        description: Option<&str>,
    ) -> std::result::Result<String, TransportError> {
        let body = SnapshotCreateSpec {
            name: name.to_string(),
            description: description.map(str::to_string),
            memory: false,
        };
        let snapshot_id: String = self
            .client
            .post(&format!("/api/vcenter/vm/{id}/snapshots"), &body)
            .await?;
        info!(vm_id = %id, %snapshot_id, "Snapshot created on host");
        Ok(snapshot_id)
    }

    async fn destroy_snapshot(
        &self,
        id: &VmId,
        snapshot_id: &str,
    ) -> std::result::Result<(), TransportError> {
        self.client
            .delete(&format!("/api/vcenter/vm/{id}/snapshots/{snapshot_id}"))
            .await?;
        info!(vm_id = %id, snapshot_id, "Snapshot deleted on host");
        Ok(())
    }

    async fn set_power_state(
        &self,
        id: &VmId,
        action: PowerAction,
    ) -> std::result::Result<(), TransportError> {
        let action = match action {
            PowerAction::On => "start",
            PowerAction::Off => "stop",
            PowerAction::Suspend => "suspend",
        };
        self.power(id.as_str(), action).await?;
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.client.logout().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_spec_carries_sizing_and_placement() {
        let mut config = VsphereConfig::new("esxi01", "root", "secret");
        config.placement.folder = Some("group-v3".into());
        let transport = VsphereTransport::new(&config).unwrap();

        let spec = VmSpec::new("web1", "datastore-11", 2, 2048).with_disk_gb(20);
        let body = transport.create_spec(&spec);

        assert_eq!(body.guest_os, "OTHER");
        assert_eq!(body.placement.datastore, "datastore-11");
        assert_eq!(body.placement.folder.as_deref(), Some("group-v3"));
        assert_eq!(body.cpu.count, 2);
        assert_eq!(body.memory.size_mib, 2048);
        assert_eq!(body.disks[0].new_vmdk.capacity, 20 * GIB);
        assert_eq!(transport.identity().to_string(), "root@esxi01:443");
    }

    #[test]
    fn test_unsupported_update_fields() {
        let update = VmUpdate::new().with_cpu_count(2).with_memory_mb(4096);
        assert!(unsupported_fields(&update).is_empty());

        let update = update.with_name("web2").with_annotation("notes");
        assert_eq!(unsupported_fields(&update), vec!["name", "annotation"]);
    }

    #[test]
    fn test_partial_failure_is_unconfirmed() {
        let err = partial_failure(
            "VM was powered off for deletion",
            VsphereError::Api {
                status: 500,
                body: "internal".into(),
            },
        );
        assert_eq!(err.kind, vtools_esxi::TransportErrorKind::Unconfirmed);
        assert!(err.message.starts_with("VM was powered off for deletion, then:"));
    }

    #[test]
    fn test_guest_os_passthrough() {
        assert_eq!(wire_guest_os("UBUNTU_64"), "UBUNTU_64");
        assert_eq!(wire_guest_os("otherGuest64"), "OTHER_64");
    }
}
