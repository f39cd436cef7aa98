// Shared fakes for lifecycle tests: an in-memory orchestrator and gateway
// implementing the real traits, plus a scratch session store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;

use session_broker::config::{DatabaseSettings, ProfilesConfig, Settings};
use session_broker::domain::VNC_PORT;
use session_broker::error::{BrokerError, Result};
use session_broker::gateway::{ActiveConnection, GatewayApi};
use session_broker::lifecycle::LifecycleObserver;
use session_broker::monitoring::BrokerMetrics;
use session_broker::orchestrator::{
    ManagedWorkload, Orchestrator, PoolWorkload, WorkloadInfo, WorkloadSpec,
};
use session_broker::pool::PoolManager;
use session_broker::profile::UserProfiles;
use session_broker::provision::Provisioner;
use session_broker::store::SessionStore;

/// The readiness probe dials the workload address on the real VNC port.
/// Keep one listener per process so fake workloads at 127.0.0.1 probe as
/// ready; if another test process already owns the port, its listener
/// serves the same purpose.
pub fn ensure_probe_listener() {
    static LISTENER: OnceLock<Option<TcpListener>> = OnceLock::new();
    LISTENER.get_or_init(|| TcpListener::bind(("127.0.0.1", VNC_PORT)).ok());
}

#[derive(Debug, Clone)]
pub struct FakeWorkload {
    pub session_id: String,
    pub username: Option<String>,
    pub ip: String,
    pub running: bool,
}

#[derive(Default)]
struct OrchestratorState {
    workloads: HashMap<String, FakeWorkload>,
    next_id: usize,
    destroyed: Vec<String>,
}

/// In-memory orchestrator. Spawned workloads get a 127.0.0.1 address so
/// the readiness probe succeeds against the shared listener.
#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<OrchestratorState>,
    pub spawn_calls: AtomicUsize,
    /// When set, this many upcoming spawns return an unreachable address.
    pub unreachable_spawns: AtomicUsize,
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        ensure_probe_listener();
        Arc::new(Self::default())
    }

    /// Register a pre-existing pool workload, as the pool manager would
    /// have created it.
    pub fn add_pool_workload(&self, workload_id: &str, session_id: &str) {
        self.add_pool_workload_at(workload_id, session_id, "127.0.0.1");
    }

    pub fn add_pool_workload_at(&self, workload_id: &str, session_id: &str, ip: &str) {
        let mut state = self.state.lock();
        state.workloads.insert(
            workload_id.to_string(),
            FakeWorkload {
                session_id: session_id.to_string(),
                username: None,
                ip: ip.to_string(),
                running: true,
            },
        );
    }

    pub fn add_claimed_workload(&self, workload_id: &str, session_id: &str, username: &str) {
        let mut state = self.state.lock();
        state.workloads.insert(
            workload_id.to_string(),
            FakeWorkload {
                session_id: session_id.to_string(),
                username: Some(username.to_string()),
                ip: "127.0.0.1".to_string(),
                running: true,
            },
        );
    }

    pub fn kill(&self, workload_id: &str) {
        if let Some(w) = self.state.lock().workloads.get_mut(workload_id) {
            w.running = false;
        }
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn workload(&self, workload_id: &str) -> Option<FakeWorkload> {
        self.state.lock().workloads.get(workload_id).cloned()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn spawn(&self, spec: &WorkloadSpec) -> Result<WorkloadInfo> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        let unreachable = self
            .unreachable_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let mut state = self.state.lock();
        state.next_id += 1;
        let workload_id = format!("w-{}", state.next_id);
        // 192.0.2.0/24 is reserved; nothing answers there.
        let ip = if unreachable {
            "192.0.2.1".to_string()
        } else {
            "127.0.0.1".to_string()
        };
        state.workloads.insert(
            workload_id.clone(),
            FakeWorkload {
                session_id: spec.session_id.clone(),
                username: spec.username.clone(),
                ip: ip.clone(),
                running: true,
            },
        );
        Ok(WorkloadInfo {
            workload_id,
            workload_ip: ip,
        })
    }

    async fn destroy(&self, workload_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.workloads.remove(workload_id);
        state.destroyed.push(workload_id.to_string());
        Ok(())
    }

    async fn is_running(&self, workload_id: &str) -> bool {
        self.state
            .lock()
            .workloads
            .get(workload_id)
            .map(|w| w.running)
            .unwrap_or(false)
    }

    async fn list_managed(&self) -> Result<Vec<ManagedWorkload>> {
        Ok(self
            .state
            .lock()
            .workloads
            .iter()
            .map(|(id, w)| ManagedWorkload {
                id: id.clone(),
                name: format!("vnc-{}", w.session_id),
                status: if w.running { "running" } else { "exited" }.to_string(),
                labels: HashMap::new(),
            })
            .collect())
    }

    async fn running_count(&self) -> usize {
        self.state
            .lock()
            .workloads
            .values()
            .filter(|w| w.running)
            .count()
    }

    async fn memory_used_gb(&self) -> f64 {
        0.0
    }

    async fn list_pool(&self) -> Result<Vec<PoolWorkload>> {
        Ok(self
            .state
            .lock()
            .workloads
            .iter()
            .filter(|(_, w)| w.running && w.username.is_none())
            .map(|(id, w)| PoolWorkload {
                id: id.clone(),
                session_id: w.session_id.clone(),
                ip: w.ip.clone(),
            })
            .collect())
    }

    async fn claim_labels(&self, workload_id: &str, username: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.workloads.get_mut(workload_id) {
            Some(w) => {
                w.username = Some(username.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeConnection {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Default)]
struct GatewayState {
    users: Vec<String>,
    groups: HashMap<String, Vec<String>>,
    connections: HashMap<String, FakeConnection>,
    permissions: Vec<(String, String)>,
    active: HashMap<String, ActiveConnection>,
    next_id: usize,
}

/// In-memory gateway catalog.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub grant_calls: AtomicUsize,
    pub home_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_user(&self, username: &str) {
        self.state.lock().users.push(username.to_string());
    }

    pub fn set_groups(&self, username: &str, groups: &[&str]) {
        self.state.lock().groups.insert(
            username.to_string(),
            groups.iter().map(|g| g.to_string()).collect(),
        );
    }

    pub fn connection(&self, connection_id: &str) -> Option<FakeConnection> {
        self.state.lock().connections.get(connection_id).cloned()
    }

    pub fn permissions(&self) -> Vec<(String, String)> {
        self.state.lock().permissions.clone()
    }

    /// Mark a connection as having an active tunnel.
    pub fn set_active(&self, connection_id: &str, username: &str) {
        let mut state = self.state.lock();
        let key = format!("active-{connection_id}");
        state.active.insert(
            key,
            ActiveConnection {
                connection_id: Some(connection_id.to_string()),
                username: Some(username.to_string()),
            },
        );
    }

    pub fn clear_active(&self, connection_id: &str) {
        self.state
            .lock()
            .active
            .retain(|_, c| c.connection_id.as_deref() != Some(connection_id));
    }
}

#[async_trait]
impl GatewayApi for FakeGateway {
    async fn list_users(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().users.clone())
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .groups
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_connection(
        &self,
        name: &str,
        host: &str,
        port: u16,
        password: &str,
        _username: &str,
    ) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.connections.insert(
            id.clone(),
            FakeConnection {
                name: name.to_string(),
                host: host.to_string(),
                port,
                password: password.to_string(),
            },
        );
        Ok(id)
    }

    async fn update_connection(
        &self,
        connection_id: &str,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        match state.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.host = host.to_string();
                conn.port = port;
                conn.password = password.to_string();
                Ok(())
            }
            None => Err(BrokerError::Upstream {
                status: 404,
                body: format!("no connection {connection_id}"),
            }),
        }
    }

    async fn grant_permission(&self, username: &str, connection_id: &str) -> Result<()> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .permissions
            .push((username.to_string(), connection_id.to_string()));
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.state.lock().connections.remove(connection_id);
        Ok(())
    }

    async fn list_active_connections(&self) -> Result<HashMap<String, ActiveConnection>> {
        Ok(self.state.lock().active.clone())
    }

    async fn create_home_placeholder(&self, _username: &str) -> Result<Option<String>> {
        self.home_calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn sync_connection_config(&self, _connection_id: &str, _username: &str) -> bool {
        true
    }
}

/// Everything a lifecycle test needs, wired over a scratch database.
pub struct TestHarness {
    pub settings: Arc<Settings>,
    pub store: SessionStore,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub gateway: Arc<FakeGateway>,
    pub provisioner: Arc<Provisioner>,
    pub observer: Arc<LifecycleObserver>,
    pub pool: Arc<PoolManager>,
    pub metrics: Arc<BrokerMetrics>,
    _scratch: tempfile::TempDir,
}

pub async fn harness(mutate: impl FnOnce(&mut Settings)) -> TestHarness {
    let scratch = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.guacamole.admin_password = "secret".into();
    settings.database = DatabaseSettings {
        url: format!(
            "sqlite://{}?mode=rwc",
            scratch.path().join("broker.db").display()
        ),
        pool_min: 1,
        pool_max: 4,
    };
    settings.profile.data_root = scratch.path().join("user-data");
    settings.containers.vnc_timeout = 2;
    mutate(&mut settings);
    let settings = Arc::new(settings);

    let store = SessionStore::connect(&settings.database).await.unwrap();
    let orchestrator = FakeOrchestrator::new();
    let gateway = FakeGateway::new();
    let metrics = Arc::new(BrokerMetrics::new());
    let profiles = Arc::new(UserProfiles::new(&settings, ProfilesConfig::default()));

    let gateway_api: Arc<dyn GatewayApi> = gateway.clone();
    let orchestrator_api: Arc<dyn Orchestrator> = orchestrator.clone();
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&settings),
        store.clone(),
        Arc::clone(&gateway_api),
        Arc::clone(&orchestrator_api),
        profiles,
        Arc::clone(&metrics),
    ));
    let observer = Arc::new(LifecycleObserver::new(
        Arc::clone(&settings),
        store.clone(),
        Arc::clone(&gateway_api),
        Arc::clone(&orchestrator_api),
        Arc::clone(&provisioner),
        Arc::clone(&metrics),
    ));
    let pool = Arc::new(PoolManager::new(
        Arc::clone(&settings),
        store.clone(),
        Arc::clone(&orchestrator_api),
        Arc::clone(&observer),
        Arc::clone(&metrics),
    ));

    TestHarness {
        settings,
        store,
        orchestrator,
        gateway,
        provisioner,
        observer,
        pool,
        metrics,
        _scratch: scratch,
    }
}

/// Insert a pool row + matching fake workload, as pool maintenance would.
pub async fn seed_pool_entry(
    harness: &TestHarness,
    session_id: &str,
    workload_id: &str,
    created_at: i64,
) {
    harness
        .orchestrator
        .add_pool_workload(workload_id, session_id);
    let session = session_broker::domain::Session {
        session_id: session_id.to_string(),
        vnc_password: Some("pool-pw".to_string()),
        workload_id: Some(workload_id.to_string()),
        workload_ip: Some("127.0.0.1".to_string()),
        created_at: Some(created_at),
        started_at: Some(created_at),
        ..Default::default()
    };
    harness.store.save(&session).await.unwrap();
}
