//! vtools: manage VMs and datastores on an ESXi host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vtools_esxi::{DatastoreId, EsxiAccount, PowerState, Vm, VmId, VmSpec, VmUpdate};
use vtools_vsphere::{VsphereConfig, VsphereTransport};

mod config;
mod output;

use config::Config;

const DEFAULT_FILTER: &str = "vtools=info,vtools_esxi=info,vtools_vsphere=info";
const VERBOSE_FILTER: &str = "vtools=debug,vtools_esxi=debug,vtools_vsphere=debug";

#[derive(Parser)]
#[command(name = "vtools", version)]
#[command(about = "Manage VMs and datastores on an ESXi host", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/vtools/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change the connection settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Manage VMs
    #[command(subcommand)]
    Vm(VmCommand),

    /// Inspect datastores
    #[command(subcommand)]
    Datastore(DatastoreCommand),

    /// Manage VM snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Store connection settings
    Set {
        /// ESXi or vCenter hostname
        #[arg(long)]
        host: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        password: String,

        #[arg(long, default_value = "443")]
        port: u16,

        /// Accept self-signed certificates
        #[arg(long)]
        insecure: bool,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Print the stored settings (password masked)
    Get,
}

#[derive(Subcommand)]
enum VmCommand {
    /// List VMs
    List {
        /// Only VMs whose name contains this text
        #[arg(long)]
        name: Option<String>,
    },

    /// Show one VM
    Get {
        /// VM name or ID
        vm: String,
    },

    /// Create a VM
    Create(CreateArgs),

    /// Change a VM's name or sizing
    Edit(EditArgs),

    /// Delete a VM (powered-on VMs are stopped first)
    Delete {
        /// VM name or ID
        vm: String,
    },

    /// Power on a VM
    PowerOn {
        /// VM name or ID
        vm: String,
    },

    /// Power off a VM (hard)
    PowerOff {
        /// VM name or ID
        vm: String,
    },

    /// Suspend a VM
    Suspend {
        /// VM name or ID
        vm: String,
    },
}

#[derive(Args)]
struct CreateArgs {
    name: String,

    /// Datastore name or ID
    #[arg(long)]
    datastore: String,

    /// Number of vCPUs
    #[arg(long, default_value = "1")]
    cpus: u32,

    /// Memory in MB
    #[arg(long, default_value = "1024")]
    memory_mb: u64,

    /// Primary disk size in GB
    #[arg(long)]
    disk_gb: Option<u64>,

    /// Guest OS identifier
    #[arg(long)]
    guest_id: Option<String>,

    /// Free-form notes
    #[arg(long)]
    annotation: Option<String>,

    /// Leave the VM powered off
    #[arg(long)]
    no_power_on: bool,
}

#[derive(Args)]
struct EditArgs {
    /// VM name or ID
    vm: String,

    /// New name
    #[arg(long)]
    name: Option<String>,

    /// Number of vCPUs
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory in MB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Guest OS identifier
    #[arg(long)]
    guest_id: Option<String>,

    /// Free-form notes
    #[arg(long)]
    annotation: Option<String>,
}

impl EditArgs {
    fn update(&self) -> VmUpdate {
        VmUpdate {
            name: self.name.clone(),
            cpu_count: self.cpus,
            memory_mb: self.memory_mb,
            guest_id: self.guest_id.clone(),
            annotation: self.annotation.clone(),
        }
    }
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// List a VM's snapshots
    List {
        /// VM name or ID
        vm: String,
    },

    /// Take a snapshot (disk state only)
    Create {
        /// VM name or ID
        vm: String,

        /// Snapshot name
        name: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a snapshot
    Delete {
        /// VM name or ID
        vm: String,

        /// Snapshot name or ID
        snapshot: String,
    },
}

#[derive(Subcommand)]
enum DatastoreCommand {
    /// List datastores
    List,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn connect(config: &Config) -> Result<EsxiAccount> {
    let transport = VsphereTransport::new(&config.connection)
        .context("Failed to set up vSphere client")?;
    let identity = transport.identity().clone();
    EsxiAccount::connect(identity, Arc::new(transport), config.lifecycle_config())
        .await
        .with_context(|| format!("Cannot connect to {}", config.connection.endpoint()))
}

/// Look a VM up by ID first, then by exact name.
fn resolve_vm(account: &EsxiAccount, name_or_id: &str) -> Result<Vm> {
    if let Ok(vm) = account.get_vm(&VmId::from(name_or_id)) {
        return Ok(vm);
    }
    match account.find_vm_by_name(name_or_id)? {
        Some(vm) => Ok(vm),
        None => bail!("VM '{}' not found", name_or_id),
    }
}

fn resolve_datastore(account: &EsxiAccount, name_or_id: &str) -> Result<DatastoreId> {
    let id = DatastoreId::from(name_or_id);
    if account.get_datastore(&id)?.is_some() {
        return Ok(id);
    }
    match account.find_datastore_by_name(name_or_id)? {
        Some(ds) => Ok(ds.id),
        None => bail!("Datastore '{}' not found", name_or_id),
    }
}

fn run_config(command: ConfigCommand, path: &std::path::Path, json: bool) -> Result<()> {
    match command {
        ConfigCommand::Set {
            host,
            user,
            password,
            port,
            insecure,
            timeout,
        } => {
            let mut connection = VsphereConfig::new(host, user, password);
            connection.port = port;
            connection.insecure = insecure;
            connection.timeout_secs = timeout;

            // Keep tuning and placement from an existing file.
            let config = match Config::load_optional(path)? {
                Some(mut existing) => {
                    connection.placement = existing.connection.placement.clone();
                    existing.connection = connection;
                    existing
                }
                None => Config::new(connection),
            };
            config.save(path)?;
            println!("Saved config to {}", path.display());
        }

        ConfigCommand::Get => {
            let config = Config::load(path)?.masked();
            if json {
                output::print_json(&config)?;
            } else {
                let c = &config.connection;
                println!("Host:     {}", c.host);
                println!("Port:     {}", c.port);
                println!("User:     {}", c.username);
                println!("Password: {}", c.password);
                println!("Insecure: {}", c.insecure);
                println!("Timeout:  {}s", c.timeout_secs);
            }
        }
    }
    Ok(())
}

async fn run_vm(command: VmCommand, account: &EsxiAccount, json: bool) -> Result<()> {
    match command {
        VmCommand::List { name } => {
            let vms = match name {
                Some(filter) => account.filter_vms(|vm| vm.name.contains(&filter))?,
                None => account.list_vms()?,
            };
            output::print_vms(&vms, json)?;
        }

        VmCommand::Get { vm } => {
            let vm = resolve_vm(account, &vm)?;
            output::print_vm(&vm, json)?;
        }

        VmCommand::Create(args) => {
            let datastore_id = resolve_datastore(account, &args.datastore)?;
            let mut spec = VmSpec::new(&args.name, datastore_id, args.cpus, args.memory_mb);
            if let Some(disk_gb) = args.disk_gb {
                spec = spec.with_disk_gb(disk_gb);
            }
            if let Some(guest_id) = args.guest_id {
                spec = spec.with_guest_id(guest_id);
            }
            if let Some(annotation) = args.annotation {
                spec = spec.with_annotation(annotation);
            }
            if args.no_power_on {
                spec = spec.powered_off();
            }

            let vm = account
                .create_vm(spec)
                .await
                .with_context(|| format!("Failed to create VM '{}'", args.name))?;
            if json {
                output::print_json(&vm)?;
            } else {
                println!(
                    "Created VM: {} ({}, state: {})",
                    vm.name, vm.id, vm.power_state
                );
                // Power-on failures after a successful create are only logged.
                if !args.no_power_on && vm.power_state != PowerState::Running {
                    eprintln!("Warning: VM was created but is not running");
                }
            }
        }

        VmCommand::Edit(args) => {
            let update = args.update();
            let vm = resolve_vm(account, &args.vm)?;
            let vm = account
                .reconfigure_vm(&vm.id, update)
                .await
                .with_context(|| format!("Failed to edit VM '{}'", vm.name))?;
            if json {
                output::print_json(&vm)?;
            } else {
                println!(
                    "Updated VM: {} ({} vCPUs, {}MB)",
                    vm.name, vm.resources.cpu_count, vm.resources.memory_mb
                );
            }
        }

        VmCommand::Delete { vm } => {
            let vm = resolve_vm(account, &vm)?;
            account
                .destroy_vm(&vm.id)
                .await
                .with_context(|| format!("Failed to delete VM '{}'", vm.name))?;
            println!("Deleted VM: {} ({})", vm.name, vm.id);
        }

        VmCommand::PowerOn { vm } => {
            let vm = resolve_vm(account, &vm)?;
            let vm = account.power_on(&vm.id).await?;
            println!("Powered on VM: {} (state: {})", vm.name, vm.power_state);
        }

        VmCommand::PowerOff { vm } => {
            let vm = resolve_vm(account, &vm)?;
            let vm = account.power_off(&vm.id).await?;
            println!("Powered off VM: {} (state: {})", vm.name, vm.power_state);
        }

        VmCommand::Suspend { vm } => {
            let vm = resolve_vm(account, &vm)?;
            let vm = account.suspend(&vm.id).await?;
            println!("Suspended VM: {} (state: {})", vm.name, vm.power_state);
        }
    }
    Ok(())
}

async fn run_snapshot(command: SnapshotCommand, account: &EsxiAccount, json: bool) -> Result<()> {
    match command {
        SnapshotCommand::List { vm } => {
            let vm = resolve_vm(account, &vm)?;
            let snapshots = account.list_snapshots(&vm.id).await?;
            output::print_snapshots(&snapshots, json)?;
        }

        SnapshotCommand::Create {
            vm,
            name,
            description,
        } => {
            let vm = resolve_vm(account, &vm)?;
            let snapshot = account
                .create_snapshot(&vm.id, &name, description.as_deref())
                .await
                .with_context(|| format!("Failed to snapshot VM '{}'", vm.name))?;
            if json {
                output::print_json(&snapshot)?;
            } else {
                println!("Created snapshot: {} ({})", snapshot.name, snapshot.id);
            }
        }

        SnapshotCommand::Delete { vm, snapshot } => {
            let vm = resolve_vm(account, &vm)?;
            account
                .destroy_snapshot(&vm.id, &snapshot)
                .await
                .with_context(|| format!("Failed to delete snapshot '{}'", snapshot))?;
            println!("Deleted snapshot: {} of VM {}", snapshot, vm.name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    debug!(path = %path.display(), "Using config file");

    let command = match cli.command {
        Commands::Config(command) => return run_config(command, &path, cli.json),
        other => other,
    };

    let config = Config::load(&path)?;
    let account = connect(&config).await?;

    let result = match command {
        Commands::Vm(command) => run_vm(command, &account, cli.json).await,
        Commands::Snapshot(command) => run_snapshot(command, &account, cli.json).await,
        Commands::Datastore(DatastoreCommand::List) => {
            account
                .list_datastores()
                .map_err(anyhow::Error::from)
                .and_then(|ds| output::print_datastores(&ds, cli.json))
        }
        Commands::Config(_) => Ok(()),
    };

    if let Err(e) = account.disconnect().await {
        warn!(error = %e, "Failed to close host session");
    }
    result
}
