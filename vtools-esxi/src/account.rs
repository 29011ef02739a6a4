//! Caller-facing facade over one host session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::audit::EsxiAuditLogger;
use crate::error::{EsxiError, Result};
use crate::inventory::{InventoryCache, InventoryDiff};
use crate::lifecycle::{LifecycleConfig, ResourceLifecycleManager};
use crate::transport::HostTransport;
use crate::types::{
    AccountIdentity, Datastore, DatastoreId, OperationKind, PendingOperation, Snapshot, Vm, VmId,
    VmSpec, VmUpdate,
};

/// One credentialed host session bound to its inventory cache and lifecycle
/// manager. Share it between tasks through an `Arc`.
pub struct EsxiAccount {
    identity: AccountIdentity,
    transport: Arc<dyn HostTransport>,
    lifecycle: ResourceLifecycleManager,
    audit: EsxiAuditLogger,
}

impl EsxiAccount {
    /// Build an account without touching the host. Reads fail with
    /// [`EsxiError::NotInitialized`] until [`reconcile`](Self::reconcile)
    /// succeeds.
    pub fn new(
        identity: AccountIdentity,
        transport: Arc<dyn HostTransport>,
        config: LifecycleConfig,
    ) -> Self {
        let audit = EsxiAuditLogger::new(&identity);
        let lifecycle = ResourceLifecycleManager::new(
            Arc::clone(&transport),
            Arc::new(InventoryCache::new()),
            config,
            audit.clone(),
        );
        Self {
            identity,
            transport,
            lifecycle,
            audit,
        }
    }

    /// Build an account and load its inventory.
    pub async fn connect(
        identity: AccountIdentity,
        transport: Arc<dyn HostTransport>,
        config: LifecycleConfig,
    ) -> Result<Self> {
        let account = Self::new(identity, transport, config);
        account.reconcile().await?;

        let snapshot = account.cache().snapshot()?;
        info!(
            account = %account.identity,
            vms = snapshot.vms().len(),
            datastores = snapshot.datastores().len(),
            "Connected to host"
        );
        account
            .audit
            .account_connected(snapshot.vms().len(), snapshot.datastores().len());
        Ok(account)
    }

    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    fn cache(&self) -> &InventoryCache {
        self.lifecycle.cache()
    }

    pub fn is_initialized(&self) -> bool {
        self.cache().is_initialized()
    }

    pub fn reconciled_at(&self) -> Option<DateTime<Utc>> {
        self.cache().reconciled_at()
    }

    // === Reads ===

    pub fn list_vms(&self) -> Result<Vec<Vm>> {
        Ok(self.lifecycle.overlay(self.cache().list_vms()?))
    }

    pub fn list_datastores(&self) -> Result<Vec<Datastore>> {
        self.cache().list_datastores()
    }

    pub fn get_vm(&self, id: &VmId) -> Result<Vm> {
        Ok(self.lifecycle.overlay_vm(self.cache().get_vm(id)?))
    }

    pub fn get_datastore(&self, id: &DatastoreId) -> Result<Option<Datastore>> {
        self.cache().get_datastore(id)
    }

    pub fn find_vm_by_name(&self, name: &str) -> Result<Option<Vm>> {
        Ok(self
            .cache()
            .find_vm_by_name(name)?
            .map(|vm| self.lifecycle.overlay_vm(vm)))
    }

    pub fn find_datastore_by_name(&self, name: &str) -> Result<Option<Datastore>> {
        self.cache().find_datastore_by_name(name)
    }

    pub fn filter_vms<F>(&self, predicate: F) -> Result<Vec<Vm>>
    where
        F: Fn(&Vm) -> bool,
    {
        Ok(self.lifecycle.overlay(self.cache().filter_vms(predicate)?))
    }

    // === Mutations ===

    pub async fn create_vm(&self, spec: VmSpec) -> Result<Vm> {
        self.lifecycle.create_vm(spec).await
    }

    pub async fn destroy_vm(&self, id: &VmId) -> Result<()> {
        self.lifecycle.destroy_vm(id).await
    }

    pub async fn power_on(&self, id: &VmId) -> Result<Vm> {
        self.lifecycle.power_on(id).await
    }

    pub async fn power_off(&self, id: &VmId) -> Result<Vm> {
        self.lifecycle.power_off(id).await
    }

    pub async fn suspend(&self, id: &VmId) -> Result<Vm> {
        self.lifecycle.suspend(id).await
    }

    pub async fn reconfigure_vm(&self, id: &VmId, update: VmUpdate) -> Result<Vm> {
        self.lifecycle.reconfigure_vm(id, update).await
    }

    pub async fn reconcile(&self) -> Result<InventoryDiff> {
        self.lifecycle.reconcile().await
    }

    // === Snapshots ===

    /// Read from the host; snapshots are not cached.
    pub async fn list_snapshots(&self, id: &VmId) -> Result<Vec<Snapshot>> {
        self.lifecycle.list_snapshots(id).await
    }

    pub async fn create_snapshot(
        &self,
        id: &VmId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Snapshot> {
        self.lifecycle.create_snapshot(id, name, description).await
    }

    pub async fn destroy_snapshot(&self, id: &VmId, name_or_id: &str) -> Result<()> {
        self.lifecycle.destroy_snapshot(id, name_or_id).await
    }

    // === Diagnostics ===

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.lifecycle.pending_operations()
    }

    pub fn recent_operations(&self) -> Vec<PendingOperation> {
        self.lifecycle.recent_operations()
    }

    /// Release the host session.
    pub async fn disconnect(&self) -> Result<()> {
        self.transport
            .close()
            .await
            .map_err(|source| EsxiError::Transport {
                operation: OperationKind::Disconnect,
                vm_id: None,
                source,
            })?;
        info!(account = %self.identity, "Disconnected from host");
        self.audit.account_disconnected();
        Ok(())
    }
}
