use serde::Serialize;
use tabled::{Table, Tabled};
use vtools_esxi::{Datastore, Snapshot, Vm};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Tabled)]
pub struct VmRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "VCPUS")]
    vcpus: u32,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "DISK")]
    disk: String,
    #[tabled(rename = "DATASTORE")]
    datastore: String,
}

impl From<&Vm> for VmRow {
    fn from(vm: &Vm) -> Self {
        Self {
            id: vm.id.to_string(),
            name: vm.name.clone(),
            state: vm.power_state.to_string(),
            vcpus: vm.resources.cpu_count,
            memory: format!("{}MB", vm.resources.memory_mb),
            disk: vm
                .resources
                .disk_gb
                .map(|gb| format!("{gb}GB"))
                .unwrap_or_else(|| "-".to_string()),
            datastore: vm
                .datastore_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
pub struct DatastoreRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "CAPACITY")]
    capacity: String,
    #[tabled(rename = "FREE")]
    free: String,
    #[tabled(rename = "VMS")]
    vms: usize,
}

impl From<&Datastore> for DatastoreRow {
    fn from(ds: &Datastore) -> Self {
        Self {
            id: ds.id.to_string(),
            name: ds.name.clone(),
            kind: ds.kind.clone().unwrap_or_else(|| "-".to_string()),
            capacity: format_bytes(ds.capacity_bytes),
            free: format_bytes(ds.free_space_bytes),
            vms: ds.vm_ids.len(),
        }
    }
}

#[derive(Tabled)]
pub struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl From<&Snapshot> for SnapshotRow {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            created: snapshot
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            description: snapshot.description.clone().unwrap_or_default(),
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / GIB)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_vms(vms: &[Vm], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(vms);
    }
    if vms.is_empty() {
        println!("No VMs found");
    } else {
        println!("{}", Table::new(vms.iter().map(VmRow::from)));
    }
    Ok(())
}

pub fn print_vm(vm: &Vm, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(vm);
    }
    println!("ID:        {}", vm.id);
    println!("Name:      {}", vm.name);
    println!("State:     {}", vm.power_state);
    println!("vCPUs:     {}", vm.resources.cpu_count);
    println!("Memory:    {}MB", vm.resources.memory_mb);
    if let Some(disk) = vm.resources.disk_gb {
        println!("Disk:      {}GB", disk);
    }
    if let Some(ds) = &vm.datastore_id {
        println!("Datastore: {}", ds);
    }
    if let Some(guest) = &vm.guest_id {
        println!("Guest:     {}", guest);
    }
    if let Some(annotation) = &vm.annotation {
        println!("Notes:     {}", annotation);
    }
    Ok(())
}

pub fn print_datastores(datastores: &[Datastore], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(datastores);
    }
    if datastores.is_empty() {
        println!("No datastores found");
    } else {
        println!("{}", Table::new(datastores.iter().map(DatastoreRow::from)));
    }
    Ok(())
}

pub fn print_snapshots(snapshots: &[Snapshot], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(snapshots);
    }
    if snapshots.is_empty() {
        println!("No snapshots found");
    } else {
        println!("{}", Table::new(snapshots.iter().map(SnapshotRow::from)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtools_esxi::{DatastoreId, PowerState, VmId, VmResources};

    #[test]
    fn test_vm_row_placeholders() {
        let vm = Vm {
            id: VmId::from("vm-7"),
            name: "web1".into(),
            power_state: PowerState::Suspended,
            datastore_id: None,
            resources: VmResources {
                cpu_count: 2,
                memory_mb: 2048,
                disk_gb: None,
            },
            guest_id: None,
            annotation: None,
        };
        let row = VmRow::from(&vm);
        assert_eq!(row.state, "suspended");
        assert_eq!(row.memory, "2048MB");
        assert_eq!(row.disk, "-");
        assert_eq!(row.datastore, "-");
    }

    #[test]
    fn test_snapshot_row() {
        let snapshot = Snapshot {
            id: "snapshot-2".into(),
            name: "nightly".into(),
            description: None,
            created_at: "2026-10-01T02:00:00Z".parse().ok(),
        };
        let row = SnapshotRow::from(&snapshot);
        assert_eq!(row.created, "2026-10-01 02:00");
        assert_eq!(row.description, "");
    }

    #[test]
    fn test_datastore_row_sizes() {
        let ds = Datastore {
            id: DatastoreId::from("datastore-11"),
            name: "datastore1".into(),
            kind: None,
            capacity_bytes: 500 * 1024 * 1024 * 1024,
            free_space_bytes: 3 * 1024 * 1024 * 1024 / 2,
            vm_ids: Default::default(),
        };
        let row = DatastoreRow::from(&ds);
        assert_eq!(row.capacity, "500.0 GiB");
        assert_eq!(row.free, "1.5 GiB");
        assert_eq!(row.kind, "-");
    }
}
