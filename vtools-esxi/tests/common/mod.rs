//! Shared fixtures for the vtools-esxi integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vtools_esxi::{
    AccountIdentity, Datastore, DatastoreId, EsxiAccount, LifecycleConfig, MockHost,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn datastore(id: &str, name: &str) -> Datastore {
    Datastore {
        id: DatastoreId::from(id),
        name: name.to_string(),
        kind: Some("VMFS".to_string()),
        capacity_bytes: 500 * 1024 * 1024 * 1024,
        free_space_bytes: 200 * 1024 * 1024 * 1024,
        vm_ids: Default::default(),
    }
}

pub fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        confirm_attempts: 3,
        confirm_interval: Duration::from_millis(10),
        history_capacity: 32,
    }
}

/// Host with one datastore `ds-1` and no VMs.
pub fn host() -> Arc<MockHost> {
    init_tracing();
    let host = Arc::new(MockHost::new());
    host.add_datastore(datastore("ds-1", "datastore1"));
    host
}

pub async fn connect(host: &Arc<MockHost>) -> EsxiAccount {
    connect_with(host, fast_config()).await
}

pub async fn connect_with(host: &Arc<MockHost>, config: LifecycleConfig) -> EsxiAccount {
    EsxiAccount::connect(
        AccountIdentity::new("esxi-test.local", "root"),
        host.clone(),
        config,
    )
    .await
    .unwrap()
}
