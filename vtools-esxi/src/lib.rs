//! vtools-esxi: inventory cache and VM lifecycle for one ESXi host account.
//!
//! # Architecture
//!
//! ```text
//! EsxiAccount
//!   +--> InventoryCache            (Arc snapshot, synchronous reads)
//!   +--> ResourceLifecycleManager  (per-resource locks, confirm by reconcile)
//!          +--> HostTransport      (vSphere REST, MockHost, ...)
//! ```
//!
//! Reads never contact the host. Mutations lock their target VM, call the
//! transport once and then reconcile until the host reflects the result.

pub mod account;
pub mod audit;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod mock;
mod operations;
pub mod transport;
pub mod types;

pub use account::EsxiAccount;
pub use audit::EsxiAuditLogger;
pub use error::{EsxiError, Result, TransportError, TransportErrorKind};
pub use inventory::{InventoryCache, InventoryDiff, InventorySnapshot};
pub use lifecycle::{LifecycleConfig, ResourceLifecycleManager};
pub use mock::MockHost;
pub use transport::HostTransport;
pub use types::{
    AccountIdentity, Datastore, DatastoreId, OperationKind, OperationStatus, PendingOperation,
    PowerAction, PowerState, Snapshot, Vm, VmId, VmResources, VmSpec, VmUpdate,
};
