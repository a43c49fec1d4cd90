//! Shared test harness: in-memory fakes for the controller adapter and the
//! node-agent client, plus a fully wired control plane on a throwaway
//! SQLite database.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use ember_control_plane::auth::hash_token;
use ember_control_plane::clients::{
    AgentError, ControllerAdapter, ControllerError, ControllerNodeState, NodeAgentApi, VmInfo,
    VmLaunchSpec,
};
use ember_control_plane::config::Config;
use ember_control_plane::db::{Database, Registration};
use ember_control_plane::gc::GarbageCollector;
use ember_control_plane::host::Platform;
use ember_control_plane::lease::LeaseState;
use ember_control_plane::provision::Provisioner;
use ember_control_plane::reconciler::Reconciler;
use ember_control_plane::scaler::Scaler;

// =============================================================================
// Fake controller
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub label: String,
    pub online: bool,
    pub busy: bool,
}

#[derive(Default)]
pub struct ControllerInner {
    pub queued: HashMap<String, i64>,
    pub nodes: HashMap<String, FakeNode>,
    pub deleted: Vec<String>,
    pub fail_create: bool,
    pub fail_list: bool,
}

#[derive(Default)]
pub struct FakeController {
    inner: Mutex<ControllerInner>,
}

impl FakeController {
    pub fn set_queue(&self, label: &str, queued: i64) {
        self.lock().queued.insert(label.to_string(), queued);
    }

    pub fn add_node(&self, name: &str) {
        self.lock().nodes.insert(name.to_string(), FakeNode::default());
    }

    pub fn set_node_state(&self, name: &str, online: bool, busy: bool) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.online = online;
            node.busy = busy;
        }
    }

    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.remove(name);
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.lock().nodes.contains_key(name)
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ControllerAdapter for FakeController {
    async fn queue_snapshot(&self) -> Result<HashMap<String, i64>, ControllerError> {
        Ok(self.lock().queued.clone())
    }

    async fn create_node(&self, name: &str, label: &str) -> Result<String, ControllerError> {
        let mut inner = self.lock();
        if inner.fail_create {
            return Err(ControllerError::Status {
                status: 500,
                detail: "induced create failure".into(),
            });
        }
        inner.nodes.insert(
            name.to_string(),
            FakeNode {
                label: label.to_string(),
                online: false,
                busy: false,
            },
        );
        Ok(format!("secret-{name}"))
    }

    async fn delete_node(&self, name: &str) -> Result<(), ControllerError> {
        let mut inner = self.lock();
        inner.nodes.remove(name);
        inner.deleted.push(name.to_string());
        Ok(())
    }

    async fn node_state(
        &self,
        name: &str,
    ) -> Result<Option<ControllerNodeState>, ControllerError> {
        Ok(self.lock().nodes.get(name).map(|n| ControllerNodeState {
            online: n.online,
            busy: n.busy,
        }))
    }

    async fn list_nodes_with_prefix(&self, prefix: &str) -> Result<Vec<String>, ControllerError> {
        let inner = self.lock();
        if inner.fail_list {
            return Err(ControllerError::Status {
                status: 503,
                detail: "induced list failure".into(),
            });
        }
        Ok(inner
            .nodes
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Fake node agent
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub base_url: String,
    pub state: String,
}

#[derive(Default)]
pub struct AgentInner {
    pub vms: HashMap<String, FakeVm>,
    pub puts: Vec<String>,
    pub deletes: Vec<String>,
    pub fail_put_status: Option<u16>,
    pub fail_delete: bool,
    pub fail_list: bool,
}

#[derive(Default)]
pub struct FakeNodeAgent {
    inner: Mutex<AgentInner>,
}

impl FakeNodeAgent {
    pub fn inject_vm(&self, vm_id: &str, base_url: &str) {
        self.lock().vms.insert(
            vm_id.to_string(),
            FakeVm {
                base_url: base_url.to_string(),
                state: "RUNNING".into(),
            },
        );
    }

    pub fn remove_vm(&self, vm_id: &str) {
        self.lock().vms.remove(vm_id);
    }

    pub fn has_vm(&self, vm_id: &str) -> bool {
        self.lock().vms.contains_key(vm_id)
    }

    pub fn puts(&self) -> Vec<String> {
        self.lock().puts.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    pub fn fail_put(&self, status: Option<u16>) {
        self.lock().fail_put_status = status;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.lock().fail_delete = fail;
    }

    pub fn fail_list(&self, fail: bool) {
        self.lock().fail_list = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NodeAgentApi for FakeNodeAgent {
    async fn ensure_vm(
        &self,
        base_url: &str,
        vm_id: &str,
        _spec: &VmLaunchSpec,
    ) -> Result<(), AgentError> {
        let mut inner = self.lock();
        if let Some(status) = inner.fail_put_status {
            return Err(AgentError::Status {
                status,
                detail: "induced launch failure".into(),
            });
        }
        inner.puts.push(vm_id.to_string());
        inner.vms.insert(
            vm_id.to_string(),
            FakeVm {
                base_url: base_url.to_string(),
                state: "BOOTING".into(),
            },
        );
        Ok(())
    }

    async fn delete_vm(
        &self,
        _base_url: &str,
        vm_id: &str,
        _reason: &str,
    ) -> Result<(), AgentError> {
        let mut inner = self.lock();
        if inner.fail_delete {
            return Err(AgentError::Status {
                status: 503,
                detail: "induced delete failure".into(),
            });
        }
        inner.vms.remove(vm_id);
        inner.deletes.push(vm_id.to_string());
        Ok(())
    }

    async fn list_vms(&self, base_url: &str) -> Result<Vec<VmInfo>, AgentError> {
        let inner = self.lock();
        if inner.fail_list {
            return Err(AgentError::Status {
                status: 503,
                detail: "induced list failure".into(),
            });
        }
        Ok(inner
            .vms
            .iter()
            .filter(|(_, vm)| vm.base_url == base_url)
            .map(|(vm_id, vm)| VmInfo {
                vm_id: vm_id.clone(),
                state: vm.state.clone(),
            })
            .collect())
    }
}

// =============================================================================
// Wired-up plane
// =============================================================================

pub struct TestPlane {
    pub db: Database,
    pub config: Arc<Config>,
    pub controller: Arc<FakeController>,
    pub agents: Arc<FakeNodeAgent>,
    pub scaler: Scaler,
    pub reconciler: Reconciler,
    pub gc: GarbageCollector,
    _db_dir: tempfile::TempDir,
}

pub async fn plane(mutate: impl FnOnce(&mut Config)) -> TestPlane {
    let db_dir = tempfile::tempdir().expect("tempdir");
    let db_path = db_dir.path().join("control_plane.db");
    let mut config = Config::for_testing();
    config.database_url = format!("sqlite://{}", db_path.display());
    // Ticks in tests are driven manually; cooldowns only get in the way.
    config.cooldown_sec = 0;
    mutate(&mut config);

    let db = Database::connect(&config.database_url).await.expect("connect");
    db.run_migrations().await.expect("migrations");

    let controller = Arc::new(FakeController::default());
    let agents = Arc::new(FakeNodeAgent::default());
    let config = Arc::new(config);

    let controller_dyn: Arc<dyn ControllerAdapter> = controller.clone();
    let agents_dyn: Arc<dyn NodeAgentApi> = agents.clone();

    let provisioner = Provisioner::new(
        db.clone(),
        controller_dyn.clone(),
        agents_dyn.clone(),
        config.clone(),
    );
    let scaler = Scaler::new(db.clone(), controller_dyn.clone(), provisioner, config.clone());
    let reconciler = Reconciler::new(
        db.clone(),
        controller_dyn.clone(),
        agents_dyn.clone(),
        config.clone(),
    );
    let gc = GarbageCollector::new(db.clone(), controller_dyn, agents_dyn, config.clone());

    TestPlane {
        db,
        config,
        controller,
        agents,
        scaler,
        reconciler,
        gc,
        _db_dir: db_dir,
    }
}

/// Bind the HTTP API on an ephemeral port against a throwaway database.
pub async fn spawn_app(
    mutate: impl FnOnce(&mut Config),
) -> (String, Database, tempfile::TempDir) {
    let db_dir = tempfile::tempdir().expect("tempdir");
    let db_path = db_dir.path().join("control_plane.db");
    let mut config = Config::for_testing();
    config.database_url = format!("sqlite://{}", db_path.display());
    mutate(&mut config);

    let db = Database::connect(&config.database_url).await.expect("connect");
    db.run_migrations().await.expect("migrations");

    let metrics = ember_control_plane::metrics::install().expect("metrics recorder");
    let state = ember_control_plane::state::AppState::new(db.clone(), config, metrics);
    let app = ember_control_plane::api::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (format!("http://{addr}"), db, db_dir)
}

/// Provision, register, and heartbeat a host directly through the store.
pub async fn seed_host(plane: &TestPlane, host_id: &str, cpu: i64, ram_mb: i64) {
    let hosts = plane.db.hosts();
    hosts
        .provision(host_id, &hash_token("bootstrap"))
        .await
        .expect("provision host");
    hosts
        .complete_registration(
            host_id,
            &hash_token("session"),
            Utc::now() + Duration::hours(1),
            &Registration {
                platform: Platform::default(),
                labels: vec![],
                agent_url: agent_url(host_id),
                cpu_total: cpu,
                ram_total_mb: ram_mb,
            },
        )
        .await
        .expect("register host");
    hosts
        .record_heartbeat(host_id, cpu, ram_mb, 0.0, &[])
        .await
        .expect("heartbeat host");
}

pub fn agent_url(host_id: &str) -> String {
    format!("http://{host_id}:9000")
}

pub async fn lease_state(plane: &TestPlane, lease_id: &str) -> LeaseState {
    plane
        .db
        .leases()
        .get(lease_id)
        .await
        .expect("get lease")
        .expect("lease exists")
        .state
}

pub async fn event_types(plane: &TestPlane, lease_id: &str) -> Vec<String> {
    plane
        .db
        .events()
        .for_lease(lease_id)
        .await
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}
