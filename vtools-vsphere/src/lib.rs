//! vSphere REST transport for vtools.
//!
//! [`VsphereTransport`] implements [`vtools_esxi::HostTransport`] against the
//! `/api` endpoints of vCenter or a standalone ESXi host and converts wire
//! DTOs into core `Vm` / `Datastore` records.

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::VsphereClient;
pub use error::VsphereError;
pub use transport::VsphereTransport;
pub use types::{PlacementConfig, VsphereConfig};
