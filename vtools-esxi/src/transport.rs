//! Boundary to the hypervisor management endpoint.
//!
//! Implementations parse and validate host responses so the rest of the crate
//! only ever sees typed inventory data.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{Datastore, PowerAction, Snapshot, Vm, VmId, VmSpec, VmUpdate};

/// Remote calls the core needs from a host.
///
/// Every method is a suspension point; implementations must not hold locks
/// shared with the core across them.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// List all VMs currently registered on the host.
    async fn list_vms(&self) -> Result<Vec<Vm>, TransportError>;

    /// List all datastores visible to the host.
    async fn list_datastores(&self) -> Result<Vec<Datastore>, TransportError>;

    /// Create a VM and return the identifier the host assigned to it.
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmId, TransportError>;

    /// Remove a VM from the host.
    async fn destroy_vm(&self, id: &VmId) -> Result<(), TransportError>;

    /// Request a power transition.
    async fn set_power_state(&self, id: &VmId, action: PowerAction)
    -> Result<(), TransportError>;

    /// Apply the set fields of `update` to an existing VM.
    async fn reconfigure_vm(&self, id: &VmId, update: &VmUpdate) -> Result<(), TransportError>;

    /// Snapshots of one VM, in host order.
    async fn list_snapshots(&self, id: &VmId) -> Result<Vec<Snapshot>, TransportError>;

    /// Take a snapshot and return its host-assigned id.
    async fn create_snapshot(
        &self,
        id: &VmId,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, TransportError>;

    async fn destroy_snapshot(&self, id: &VmId, snapshot_id: &str) -> Result<(), TransportError>;

    /// Release the session, if the transport holds one.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
