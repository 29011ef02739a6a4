//! ESXi audit logging
//!
//! Lifecycle events go to the `audit` tracing target so they can be routed
//! separately from diagnostics.

use crate::types::{AccountIdentity, OperationKind, PowerAction, VmId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditLevel {
    Audit,
    Warn,
}

/// Audit logger bound to one host account
#[derive(Debug, Clone)]
pub struct EsxiAuditLogger {
    component: &'static str,
    account: String,
    enabled: bool,
}

impl EsxiAuditLogger {
    pub fn new(identity: &AccountIdentity) -> Self {
        Self {
            component: "esxi",
            account: identity.to_string(),
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: "esxi",
            account: String::new(),
            enabled: false,
        }
    }

    fn log(&self, level: AuditLevel, message: String, object_ids: Vec<String>) {
        if !self.enabled {
            return;
        }
        match level {
            AuditLevel::Audit => tracing::info!(
                target: "audit",
                component = %self.component,
                account = %self.account,
                objects = ?object_ids,
                "{}",
                message
            ),
            AuditLevel::Warn => tracing::warn!(
                target: "audit",
                component = %self.component,
                account = %self.account,
                objects = ?object_ids,
                "{}",
                message
            ),
        }
    }

    // === VM Events ===

    pub fn vm_created(&self, vm_id: &VmId, name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("VM '{}' created", name),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_create_failed(&self, name: &str, error: &str) {
        self.log(
            AuditLevel::Warn,
            format!("VM '{}' create failed: {}", name, error),
            Vec::new(),
        );
    }

    pub fn vm_destroyed(&self, vm_id: &VmId, name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("VM '{}' destroyed", name),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_destroy_failed(&self, vm_id: &VmId, error: &str) {
        self.log(
            AuditLevel::Warn,
            format!("VM destroy failed: {}", error),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_power_changed(&self, vm_id: &VmId, action: PowerAction) {
        self.log(
            AuditLevel::Audit,
            format!("VM {} completed ({})", action.operation(), action.target_state()),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_power_failed(&self, vm_id: &VmId, action: PowerAction, error: &str) {
        self.log(
            AuditLevel::Warn,
            format!("VM {} failed: {}", action.operation(), error),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_reconfigured(&self, vm_id: &VmId, name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("VM '{}' reconfigured", name),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_reconfigure_failed(&self, vm_id: &VmId, error: &str) {
        self.log(
            AuditLevel::Warn,
            format!("VM reconfigure failed: {}", error),
            vec![vm_id.to_string()],
        );
    }

    // === Snapshot Events ===

    pub fn snapshot_created(&self, vm_id: &VmId, snapshot_id: &str, name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Snapshot '{}' created", name),
            vec![vm_id.to_string(), snapshot_id.to_string()],
        );
    }

    pub fn snapshot_destroyed(&self, vm_id: &VmId, snapshot_id: &str, name: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Snapshot '{}' destroyed", name),
            vec![vm_id.to_string(), snapshot_id.to_string()],
        );
    }

    pub fn snapshot_failed(&self, vm_id: &VmId, operation: OperationKind, error: &str) {
        self.log(
            AuditLevel::Warn,
            format!("{} failed: {}", operation, error),
            vec![vm_id.to_string()],
        );
    }

    // === Session Events ===

    pub fn account_connected(&self, vm_count: usize, datastore_count: usize) {
        self.log(
            AuditLevel::Audit,
            format!(
                "Connected ({} VMs, {} datastores)",
                vm_count, datastore_count
            ),
            Vec::new(),
        );
    }

    pub fn account_disconnected(&self) {
        self.log(AuditLevel::Audit, "Disconnected".to_string(), Vec::new());
    }
}
