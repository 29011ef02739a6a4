//! Domain types shared by the inventory, lifecycle and transport layers.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host-assigned VM identifier (e.g. `vm-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Host-assigned datastore identifier (e.g. `datastore-11`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatastoreId(String);

impl DatastoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatastoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatastoreId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DatastoreId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// VM power / lifecycle state as seen by callers.
///
/// `Creating` and `Deleting` are never reported by a host; they are overlaid
/// on reads while a matching operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Creating,
    Running,
    Stopped,
    Suspended,
    Deleting,
    #[default]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Creating => "creating",
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Suspended => "suspended",
            PowerState::Deleting => "deleting",
            PowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Power transition requested from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    On,
    Off,
    Suspend,
}

impl PowerAction {
    /// State the VM is expected to settle in once the action completes.
    pub fn target_state(self) -> PowerState {
        match self {
            PowerAction::On => PowerState::Running,
            PowerAction::Off => PowerState::Stopped,
            PowerAction::Suspend => PowerState::Suspended,
        }
    }

    pub fn operation(self) -> OperationKind {
        match self {
            PowerAction::On => OperationKind::PowerOn,
            PowerAction::Off => OperationKind::PowerOff,
            PowerAction::Suspend => OperationKind::Suspend,
        }
    }
}

/// Hardware sizing of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmResources {
    pub cpu_count: u32,
    pub memory_mb: u64,
    /// Size of the primary disk; `None` when the VM has no disk.
    #[serde(default)]
    pub disk_gb: Option<u64>,
}

/// A virtual machine as last reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: VmId,
    pub name: String,
    pub power_state: PowerState,
    /// Weak reference: resolve through the inventory, may dangle.
    pub datastore_id: Option<DatastoreId>,
    pub resources: VmResources,
    #[serde(default)]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub annotation: Option<String>,
}

impl Vm {
    /// Whether this VM was built from `spec` (name, placement and sizing).
    pub fn matches_spec(&self, spec: &VmSpec) -> bool {
        self.name == spec.name
            && self.datastore_id.as_ref() == Some(&spec.datastore_id)
            && self.resources == spec.resources
    }
}

/// A datastore on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub id: DatastoreId,
    pub name: String,
    /// Store type as reported by the host (`VMFS`, `NFS`, `VSAN`, ...).
    #[serde(default)]
    pub kind: Option<String>,
    pub capacity_bytes: u64,
    pub free_space_bytes: u64,
    /// Derived from the VM list on every reconciliation.
    #[serde(default)]
    pub vm_ids: BTreeSet<VmId>,
}

impl Datastore {
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.free_space_bytes)
    }
}

/// Request to create a new VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub datastore_id: DatastoreId,
    pub resources: VmResources,
    #[serde(default = "default_guest_id")]
    pub guest_id: String,
    #[serde(default)]
    pub annotation: Option<String>,
    /// Power the VM on once the host has created it.
    #[serde(default = "default_power_on")]
    pub power_on: bool,
}

fn default_guest_id() -> String {
    "otherGuest".to_string()
}

fn default_power_on() -> bool {
    true
}

impl VmSpec {
    pub fn new(
        name: impl Into<String>,
        datastore_id: impl Into<DatastoreId>,
        cpu_count: u32,
        memory_mb: u64,
    ) -> Self {
        Self {
            name: name.into(),
            datastore_id: datastore_id.into(),
            resources: VmResources {
                cpu_count,
                memory_mb,
                disk_gb: None,
            },
            guest_id: default_guest_id(),
            annotation: None,
            power_on: true,
        }
    }

    pub fn with_disk_gb(mut self, disk_gb: u64) -> Self {
        self.resources.disk_gb = Some(disk_gb);
        self
    }

    pub fn with_guest_id(mut self, guest_id: impl Into<String>) -> Self {
        self.guest_id = guest_id.into();
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn powered_off(mut self) -> Self {
        self.power_on = false;
        self
    }
}

/// Changes to an existing VM. Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub annotation: Option<String>,
}

impl VmUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cpu_count(mut self, cpu_count: u32) -> Self {
        self.cpu_count = Some(cpu_count);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_guest_id(mut self, guest_id: impl Into<String>) -> Self {
        self.guest_id = Some(guest_id.into());
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.cpu_count.is_none()
            && self.memory_mb.is_none()
            && self.guest_id.is_none()
            && self.annotation.is_none()
    }

    /// Write the set fields into `vm`.
    pub fn apply(&self, vm: &mut Vm) {
        if let Some(name) = &self.name {
            vm.name = name.clone();
        }
        if let Some(cpu_count) = self.cpu_count {
            vm.resources.cpu_count = cpu_count;
        }
        if let Some(memory_mb) = self.memory_mb {
            vm.resources.memory_mb = memory_mb;
        }
        if let Some(guest_id) = &self.guest_id {
            vm.guest_id = Some(guest_id.clone());
        }
        if let Some(annotation) = &self.annotation {
            vm.annotation = Some(annotation.clone());
        }
    }

    /// Whether `vm` already shows the name and sizing of this update.
    ///
    /// Guest id and annotation are not compared: hosts report them in their
    /// own vocabulary, or not at all.
    pub fn is_reflected_in(&self, vm: &Vm) -> bool {
        self.name.as_ref().is_none_or(|name| &vm.name == name)
            && self
                .cpu_count
                .is_none_or(|cpu| vm.resources.cpu_count == cpu)
            && self
                .memory_mb
                .is_none_or(|mem| vm.resources.memory_mb == mem)
    }
}

/// A point-in-time snapshot of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Host-assigned identifier, unique per VM.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kind of work tracked for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Reconcile,
    Create,
    Destroy,
    PowerOn,
    PowerOff,
    Suspend,
    Reconfigure,
    SnapshotList,
    SnapshotCreate,
    SnapshotDestroy,
    Disconnect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Reconcile => "reconcile",
            OperationKind::Create => "create",
            OperationKind::Destroy => "destroy",
            OperationKind::PowerOn => "power-on",
            OperationKind::PowerOff => "power-off",
            OperationKind::Suspend => "suspend",
            OperationKind::Reconfigure => "reconfigure",
            OperationKind::SnapshotList => "snapshot-list",
            OperationKind::SnapshotCreate => "snapshot-create",
            OperationKind::SnapshotDestroy => "snapshot-destroy",
            OperationKind::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InFlight,
    Succeeded,
    Failed,
}

/// Lock-and-status record for one mutation against one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    /// Lock key: the VM id, or `provisional-<uuid>` for a create the host
    /// has not answered yet.
    pub key: String,
    /// Resource the operation targets; `None` until the host assigns an id.
    pub target: Option<VmId>,
    pub kind: OperationKind,
    pub submitted_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure detail for operations that ended in `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl PendingOperation {
    pub(crate) fn new(key: String, target: Option<VmId>, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            target,
            kind,
            submitted_at: Utc::now(),
            status: OperationStatus::InFlight,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == OperationStatus::InFlight
    }
}

/// Provisional lock key used for a create before the host returns an id.
pub(crate) fn provisional_key() -> String {
    format!("provisional-{}", Uuid::new_v4())
}

/// Identity of the host account an [`crate::EsxiAccount`] is bound to.
///
/// Holds a reference to the credential (the user name), never the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub endpoint: String,
    pub credential_ref: String,
}

impl AccountIdentity {
    pub fn new(endpoint: impl Into<String>, credential_ref: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential_ref: credential_ref.into(),
        }
    }
}

impl fmt::Display for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.credential_ref, self.endpoint)
    }
}
