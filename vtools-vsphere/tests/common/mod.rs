//! In-process mock of the vSphere `/api` endpoints.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use vtools_vsphere::VsphereConfig;

/// `root:secret`
const VALID_AUTH: &str = "Basic cm9vdDpzZWNyZXQ=";
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MockVm {
    pub name: String,
    pub power_state: &'static str,
    pub cpu: u32,
    pub memory_mib: u64,
    pub datastore: String,
    pub disk_bytes: Option<u64>,
    pub snapshots: Vec<MockSnapshot>,
}

#[derive(Debug, Clone)]
pub struct MockSnapshot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockDatastore {
    pub id: String,
    pub name: String,
    pub capacity: u64,
    pub free_space: u64,
}

#[derive(Debug, Default)]
pub struct VcState {
    pub sessions: HashSet<String>,
    pub logins: usize,
    pub vms: BTreeMap<String, MockVm>,
    pub datastores: Vec<MockDatastore>,
    pub next_id: u32,
    pub last_create: Option<Value>,
    pub power_requests: Vec<(String, String)>,
    pub garbage_datastores: bool,
    /// Answer every VM DELETE with this status.
    pub fail_delete: Option<u16>,
    /// Answer every memory PATCH with this status.
    pub fail_memory_patch: Option<u16>,
    /// Answer every power request with this status.
    pub fail_power: Option<u16>,
    pub patches: Vec<(String, Value)>,
    pub next_snapshot: u32,
}

#[derive(Clone, Default)]
pub struct AppState(Arc<Mutex<VcState>>);

impl AppState {
    pub fn lock(&self) -> MutexGuard<'_, VcState> {
        self.0.lock().unwrap()
    }
}

pub struct MockVcenter {
    pub state: AppState,
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockVcenter {
    pub async fn spawn() -> Self {
        let state = AppState::default();
        {
            let mut s = state.lock();
            s.datastores.push(MockDatastore {
                id: "datastore-11".into(),
                name: "datastore1".into(),
                capacity: 500 * GIB,
                free_space: 200 * GIB,
            });
            s.datastores.push(MockDatastore {
                id: "datastore-12".into(),
                name: "nfs-share".into(),
                capacity: 1000 * GIB,
                free_space: 900 * GIB,
            });
        }

        let app = Router::new()
            .route("/api/session", post(create_session).delete(delete_session))
            .route("/api/vcenter/datastore", get(list_datastores))
            .route("/api/vcenter/vm", get(list_vms).post(create_vm))
            .route("/api/vcenter/vm/{vm}", get(get_vm).delete(delete_vm))
            .route("/api/vcenter/vm/{vm}/power", post(power_vm))
            .route("/api/vcenter/vm/{vm}/hardware/cpu", patch(patch_cpu))
            .route("/api/vcenter/vm/{vm}/hardware/memory", patch(patch_memory))
            .route(
                "/api/vcenter/vm/{vm}/snapshots",
                get(list_snapshots).post(create_snapshot),
            )
            .route(
                "/api/vcenter/vm/{vm}/snapshots/{snapshot}",
                delete(delete_snapshot),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            addr,
            handle,
        }
    }

    pub fn config(&self) -> VsphereConfig {
        let mut config = VsphereConfig::new("127.0.0.1", "root", "secret");
        config.port = self.addr.port();
        config.scheme = "http".to_string();
        config.timeout_secs = 5;
        config
    }

    pub fn add_vm(&self, name: &str, power_state: &'static str, datastore: &str) -> String {
        let mut s = self.state.lock();
        s.next_id += 1;
        let id = format!("vm-{}", s.next_id);
        s.vms.insert(
            id.clone(),
            MockVm {
                name: name.to_string(),
                power_state,
                cpu: 2,
                memory_mib: 4096,
                datastore: datastore.to_string(),
                disk_bytes: Some(16 * GIB),
                snapshots: Vec::new(),
            },
        );
        id
    }

    /// Forget every session, as if they all expired.
    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let sid = headers
        .get("vmware-api-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.lock().sessions.contains(sid) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error_type": "UNAUTHENTICATED"})),
        )
            .into_response())
    }
}

async fn create_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != VALID_AUTH {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error_type": "UNAUTHENTICATED"})),
        )
            .into_response();
    }
    let mut s = state.lock();
    s.logins += 1;
    let sid = format!("session-{}", s.logins);
    s.sessions.insert(sid.clone());
    (StatusCode::CREATED, Json(json!(sid))).into_response()
}

async fn delete_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    if let Some(sid) = headers
        .get("vmware-api-session-id")
        .and_then(|v| v.to_str().ok())
    {
        state.lock().sessions.remove(sid);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_datastores(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let s = state.lock();
    if s.garbage_datastores {
        return (StatusCode::OK, "<html>maintenance</html>").into_response();
    }
    let body: Vec<Value> = s
        .datastores
        .iter()
        .map(|ds| {
            json!({
                "datastore": ds.id,
                "name": ds.name,
                "type": "VMFS",
                "capacity": ds.capacity,
                "free_space": ds.free_space,
            })
        })
        .collect();
    Json(body).into_response()
}

async fn list_vms(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let body: Vec<Value> = state
        .lock()
        .vms
        .iter()
        .map(|(id, vm)| {
            json!({
                "vm": id,
                "name": vm.name,
                "power_state": vm.power_state,
                "cpu_count": vm.cpu,
                "memory_size_MiB": vm.memory_mib,
            })
        })
        .collect();
    Json(body).into_response()
}

async fn get_vm(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let s = state.lock();
    let Some(vm) = s.vms.get(&vm) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error_type": "NOT_FOUND"}))).into_response();
    };
    let mut disks = serde_json::Map::new();
    if let Some(bytes) = vm.disk_bytes {
        disks.insert(
            "2000".into(),
            json!({
                "capacity": bytes,
                "backing": {
                    "type": "VMDK_FILE",
                    "vmdk_file": format!("[{}] {}/{}.vmdk", vm.datastore, vm.name, vm.name),
                },
            }),
        );
    }
    Json(json!({
        "name": vm.name,
        "power_state": vm.power_state,
        "guest_OS": "OTHER",
        "cpu": {"count": vm.cpu, "cores_per_socket": 1},
        "memory": {"size_MiB": vm.memory_mib},
        "disks": disks,
    }))
    .into_response()
}

async fn create_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    let ds_id = body["placement"]["datastore"].as_str().unwrap_or_default();
    let Some(ds_name) = s
        .datastores
        .iter()
        .find(|ds| ds.id == ds_id)
        .map(|ds| ds.name.clone())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error_type": "INVALID_ARGUMENT"})),
        )
            .into_response();
    };

    s.next_id += 1;
    let id = format!("vm-{}", s.next_id);
    s.vms.insert(
        id.clone(),
        MockVm {
            name: body["name"].as_str().unwrap_or_default().to_string(),
            power_state: "POWERED_OFF",
            cpu: body["cpu"]["count"].as_u64().unwrap_or(1) as u32,
            memory_mib: body["memory"]["size_MiB"].as_u64().unwrap_or(0),
            datastore: ds_name,
            disk_bytes: body["disks"][0]["new_vmdk"]["capacity"].as_u64(),
            snapshots: Vec::new(),
        },
    );
    s.last_create = Some(body);
    (StatusCode::CREATED, Json(json!(id))).into_response()
}

async fn delete_vm(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    let power_state = s.vms.get(&vm).map(|v| v.power_state);
    if let (Some(_), Some(status)) = (power_state, s.fail_delete) {
        return api_error(status, "INTERNAL_SERVER_ERROR");
    }
    match power_state {
        None => (StatusCode::NOT_FOUND, Json(json!({"error_type": "NOT_FOUND"}))).into_response(),
        Some("POWERED_ON") => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error_type": "RESOURCE_IN_USE"})),
        )
            .into_response(),
        Some(_) => {
            s.vms.remove(&vm);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

#[derive(Deserialize)]
struct PowerQuery {
    action: String,
}

async fn power_vm(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    Query(query): Query<PowerQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    s.power_requests.push((vm.clone(), query.action.clone()));
    if let Some(status) = s.fail_power {
        return api_error(status, "INTERNAL_SERVER_ERROR");
    }
    let Some(v) = s.vms.get_mut(&vm) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error_type": "NOT_FOUND"}))).into_response();
    };
    v.power_state = match query.action.as_str() {
        "start" => "POWERED_ON",
        "stop" => "POWERED_OFF",
        "suspend" => "SUSPENDED",
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error_type": "INVALID_ARGUMENT"})),
            )
                .into_response();
        }
    };
    StatusCode::NO_CONTENT.into_response()
}

fn api_error(status: u16, error_type: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error_type": error_type}))).into_response()
}

fn vm_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error_type": "NOT_FOUND"}))).into_response()
}

async fn patch_cpu(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    s.patches.push((format!("{vm}/cpu"), body.clone()));
    let Some(v) = s.vms.get_mut(&vm) else {
        return vm_not_found();
    };
    if let Some(count) = body["count"].as_u64() {
        v.cpu = count as u32;
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn patch_memory(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    s.patches.push((format!("{vm}/memory"), body.clone()));
    if let Some(status) = s.fail_memory_patch {
        return api_error(status, "INVALID_ARGUMENT");
    }
    let Some(v) = s.vms.get_mut(&vm) else {
        return vm_not_found();
    };
    if let Some(size) = body["size_MiB"].as_u64() {
        v.memory_mib = size;
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_snapshots(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let s = state.lock();
    let Some(v) = s.vms.get(&vm) else {
        return vm_not_found();
    };
    let body: Vec<Value> = v
        .snapshots
        .iter()
        .map(|snap| {
            json!({
                "snapshot": snap.id,
                "name": snap.name,
                "description": snap.description,
                "creation_time": "2026-10-01T02:00:00Z",
            })
        })
        .collect();
    Json(body).into_response()
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(vm): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    s.next_snapshot += 1;
    let id = format!("snapshot-{}", s.next_snapshot);
    let Some(v) = s.vms.get_mut(&vm) else {
        return vm_not_found();
    };
    v.snapshots.push(MockSnapshot {
        id: id.clone(),
        name: body["name"].as_str().unwrap_or_default().to_string(),
        description: body["description"].as_str().map(str::to_string),
    });
    (StatusCode::CREATED, Json(json!(id))).into_response()
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((vm, snapshot)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&state, &headers) {
        return resp;
    }
    let mut s = state.lock();
    let Some(v) = s.vms.get_mut(&vm) else {
        return vm_not_found();
    };
    let before = v.snapshots.len();
    v.snapshots.retain(|snap| snap.id != snapshot);
    if v.snapshots.len() == before {
        return vm_not_found();
    }
    StatusCode::NO_CONTENT.into_response()
}
