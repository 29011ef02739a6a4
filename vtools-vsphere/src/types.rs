//! vSphere REST wire types and connection config.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vtools_esxi::PowerState;

/// Connection settings for one vCenter or ESXi endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsphereConfig {
    /// Hostname or IP (e.g. "esxi01.lab.local").
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Accept self-signed certificates.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub placement: PlacementConfig,
}

fn default_port() -> u16 {
    443
}

fn default_timeout() -> u64 {
    30
}

fn default_scheme() -> String {
    "https".to_string()
}

impl VsphereConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            insecure: false,
            timeout_secs: default_timeout(),
            scheme: default_scheme(),
            placement: PlacementConfig::default(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// `host:port` as used for the account identity.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Inventory placement for new VMs. vCenter needs at least a folder and a
/// resource pool; a standalone ESXi host picks defaults when these are unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WirePowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[serde(other)]
    Unknown,
}

impl From<WirePowerState> for PowerState {
    fn from(state: WirePowerState) -> Self {
        match state {
            WirePowerState::PoweredOn => PowerState::Running,
            WirePowerState::PoweredOff => PowerState::Stopped,
            WirePowerState::Suspended => PowerState::Suspended,
            WirePowerState::Unknown => PowerState::Unknown,
        }
    }
}

/// Entry of `GET /api/vcenter/vm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub vm: String,
    pub name: String,
    pub power_state: WirePowerState,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default, rename = "memory_size_MiB")]
    pub memory_size_mib: Option<u64>,
}

/// Body of `GET /api/vcenter/vm/{vm}`, reduced to what the inventory needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub power_state: WirePowerState,
    #[serde(default, rename = "guest_OS")]
    pub guest_os: Option<String>,
    #[serde(default)]
    pub cpu: Option<VmCpu>,
    #[serde(default)]
    pub memory: Option<VmMemory>,
    /// Keyed by device key; the lowest key is the primary disk.
    #[serde(default)]
    pub disks: BTreeMap<String, VmDisk>,
}

impl VmInfo {
    /// Disk with the numerically lowest device key. Keys that are not
    /// numbers rank last.
    pub fn primary_disk(&self) -> Option<&VmDisk> {
        self.disks
            .iter()
            .min_by_key(|(key, _)| key.parse::<u64>().unwrap_or(u64::MAX))
            .map(|(_, disk)| disk)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCpu {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMemory {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDisk {
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub backing: Option<DiskBacking>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskBacking {
    #[serde(default, rename = "type")]
    pub backing_type: Option<String>,
    /// `[datastore1] web1/web1.vmdk`
    #[serde(default)]
    pub vmdk_file: Option<String>,
}

/// Entry of `GET /api/vcenter/datastore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreSummary {
    pub datastore: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub ds_type: Option<String>,
    #[serde(default)]
    pub free_space: Option<u64>,
    #[serde(default)]
    pub capacity: Option<u64>,
}

/// Entry of `GET /api/vcenter/vm/{vm}/snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}

// ── Requests ────────────────────────────────────────────────────────

/// Body of `POST /api/vcenter/vm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateSpec {
    pub name: String,
    #[serde(rename = "guest_OS")]
    pub guest_os: String,
    pub placement: VmPlacementSpec,
    pub cpu: VmCpuSpec,
    pub memory: VmMemorySpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<VmDiskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmPlacementSpec {
    pub datastore: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCpuSpec {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMemorySpec {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDiskSpec {
    pub new_vmdk: NewVmdkSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVmdkSpec {
    /// Bytes.
    pub capacity: u64,
}

/// Body of `PATCH /api/vcenter/vm/{vm}/hardware/cpu`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCpuUpdate {
    pub count: u32,
}

/// Body of `PATCH /api/vcenter/vm/{vm}/hardware/memory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMemoryUpdate {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

/// Body of `POST /api/vcenter/vm/{vm}/snapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Include the memory of a running VM.
    pub memory: bool,
}

/// Datastore name from a `[datastore] path` vmdk reference.
pub fn datastore_name_from_vmdk(vmdk_file: &str) -> Option<&str> {
    let rest = vmdk_file.trim_start().strip_prefix('[')?;
    let (name, _) = rest.split_once(']')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_name_from_vmdk() {
        assert_eq!(
            datastore_name_from_vmdk("[datastore1] web1/web1.vmdk"),
            Some("datastore1")
        );
        assert_eq!(
            datastore_name_from_vmdk("[ nfs share ] a/b.vmdk"),
            Some("nfs share")
        );
        assert_eq!(datastore_name_from_vmdk("web1/web1.vmdk"), None);
        assert_eq!(datastore_name_from_vmdk("[] x.vmdk"), None);
    }

    #[test]
    fn test_vm_info_parses_vsphere_fields() {
        let info: VmInfo = serde_json::from_str(
            r#"{
                "name": "web1",
                "power_state": "POWERED_ON",
                "guest_OS": "UBUNTU_64",
                "cpu": {"count": 2, "cores_per_socket": 1},
                "memory": {"size_MiB": 2048, "hot_add_enabled": false},
                "disks": {
                    "2001": {"capacity": 1073741824, "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds2] web1/web1_1.vmdk"}},
                    "2000": {"capacity": 21474836480, "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] web1/web1.vmdk"}}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(info.power_state, WirePowerState::PoweredOn);
        assert_eq!(info.cpu.unwrap().count, 2);
        let (key, primary) = info.disks.iter().next().unwrap();
        assert_eq!(key, "2000");
        assert_eq!(primary.capacity, Some(20 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_unknown_power_state() {
        let state: WirePowerState = serde_json::from_str(r#""POWERING_ON""#).unwrap();
        assert_eq!(PowerState::from(state), PowerState::Unknown);
    }

    #[test]
    fn test_create_spec_omits_unset_placement() {
        let spec = VmCreateSpec {
            name: "web1".into(),
            guest_os: "OTHER_LINUX_64".into(),
            placement: VmPlacementSpec {
                datastore: "datastore-11".into(),
                ..Default::default()
            },
            cpu: VmCpuSpec { count: 2 },
            memory: VmMemorySpec { size_mib: 2048 },
            disks: Vec::new(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["placement"], serde_json::json!({"datastore": "datastore-11"}));
        assert_eq!(json["memory"]["size_MiB"], 2048);
        assert!(json.get("disks").is_none());
    }

    #[test]
    fn test_primary_disk_uses_numeric_device_key() {
        let info: VmInfo = serde_json::from_str(
            r#"{
                "name": "web1",
                "power_state": "POWERED_OFF",
                "disks": {
                    "16000": {"capacity": 1, "backing": {"vmdk_file": "[nvme-ds] web1/web1_1.vmdk"}},
                    "2000": {"capacity": 2, "backing": {"vmdk_file": "[datastore1] web1/web1.vmdk"}}
                }
            }"#,
        )
        .unwrap();

        let disk = info.primary_disk().unwrap();
        assert_eq!(disk.capacity, Some(2));
        assert_eq!(
            disk.backing.as_ref().and_then(|b| b.vmdk_file.as_deref()),
            Some("[datastore1] web1/web1.vmdk")
        );
    }

    #[test]
    fn test_snapshot_summary_parses_creation_time() {
        let snap: SnapshotSummary = serde_json::from_str(
            r#"{"snapshot": "snapshot-3", "name": "nightly", "creation_time": "2026-10-01T02:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(snap.snapshot, "snapshot-3");
        assert!(snap.description.is_none());
        assert_eq!(
            snap.creation_time.map(|t| t.to_rfc3339()),
            Some("2026-10-01T02:00:00+00:00".to_string())
        );
    }
}
