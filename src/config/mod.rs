// # Broker configuration
//
// Immutable, validated settings built once at startup from `broker.yml`
// plus defaults. Every field is enumerated; unknown keys are ignored and
// missing keys fall back section by section. Secrets never live in YAML:
// they are overlaid from the environment after parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{BrokerError, Result};

pub mod profiles;

pub use profiles::{EffectiveProfile, ProfilesConfig};

/// Environment variable naming the config directory.
pub const CONFIG_DIR_ENV: &str = "BROKER_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "/data/config";
const BROKER_CONFIG_FILE: &str = "broker.yml";
const PROFILES_CONFIG_FILE: &str = "profiles.yml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between user-directory reconciliation passes.
    pub interval: u64,
    /// Gateway accounts that never get a session (admin accounts).
    pub ignored_users: Vec<String>,
    /// Rewrite catalog-entry parameters from current config once at startup.
    pub sync_config_on_restart: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: 60,
            ignored_users: vec!["guacadmin".into()],
            sync_config_on_restart: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorBackend {
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Engine API endpoint (tcp socket, e.g. a socket-proxy sidecar).
    pub host: String,
    /// Overrides `containers.network` when set.
    pub network: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:2375".into(),
            network: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesResourceSpec {
    pub memory: String,
    pub cpu: String,
}

impl Default for KubernetesResourceSpec {
    fn default() -> Self {
        Self {
            memory: "512Mi".into(),
            cpu: "250m".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesResources {
    pub requests: KubernetesResourceSpec,
    pub limits: KubernetesResourceSpec,
}

impl Default for KubernetesResources {
    fn default() -> Self {
        Self {
            requests: KubernetesResourceSpec::default(),
            limits: KubernetesResourceSpec {
                memory: "2Gi".into(),
                cpu: "1000m".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesSecurityContext {
    pub run_as_non_root: bool,
    pub run_as_user: i64,
}

impl Default for KubernetesSecurityContext {
    fn default() -> Self {
        Self {
            run_as_non_root: false,
            run_as_user: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    pub namespace: String,
    pub service_account: String,
    /// Extra labels merged onto every workload pod.
    pub labels: HashMap<String, String>,
    pub image_pull_policy: String,
    pub image_pull_secrets: Vec<String>,
    pub node_selector: HashMap<String, String>,
    pub tolerations: Vec<serde_json::Value>,
    pub resources: KubernetesResources,
    pub security_context: KubernetesSecurityContext,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: "guacamole".into(),
            service_account: String::new(),
            labels: HashMap::from([
                ("app".into(), "vnc-session".into()),
                ("managed-by".into(), "session-broker".into()),
            ]),
            image_pull_policy: "IfNotPresent".into(),
            image_pull_secrets: Vec::new(),
            node_selector: HashMap::new(),
            tolerations: Vec::new(),
            resources: KubernetesResources::default(),
            security_context: KubernetesSecurityContext::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub backend: OrchestratorBackend,
    pub docker: DockerSettings,
    pub kubernetes: KubernetesSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            backend: OrchestratorBackend::Docker,
            docker: DockerSettings::default(),
            kubernetes: KubernetesSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainersSettings {
    pub image: String,
    /// Catalog entry name shown to the user.
    pub connection_name: String,
    pub network: String,
    pub memory_limit: String,
    pub shm_size: String,
    /// Readiness probe deadline in seconds.
    pub vnc_timeout: u64,
    /// Named volume mounted read-write at /user-data in every workload.
    pub user_data_volume: String,
}

impl Default for ContainersSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/maximewewer/docker-browser-vnc:latest".into(),
            connection_name: "Virtual Desktop".into(),
            network: "guacamole_vnc-network".into(),
            memory_limit: "1g".into(),
            shm_size: "128m".into(),
            vnc_timeout: 30,
            user_data_volume: "guacamole_user_profiles".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Keep the workload running after the user disconnects.
    pub persist_after_disconnect: bool,
    /// Idle workloads older than this are swept; 0 disables the sweep.
    pub idle_timeout_minutes: i64,
    pub force_kill_on_low_resources: bool,
    /// Seconds between active-connection polls.
    pub poll_interval: u64,
    /// Idle sweep runs every this many observer ticks.
    pub cleanup_every_ticks: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            persist_after_disconnect: true,
            idle_timeout_minutes: 3,
            force_kill_on_low_resources: true,
            poll_interval: 5,
            cleanup_every_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolResourceSettings {
    pub min_free_memory_gb: f64,
    pub max_total_memory_gb: f64,
    pub max_memory_percent: f64,
}

impl Default for PoolResourceSettings {
    fn default() -> Self {
        Self {
            min_free_memory_gb: 2.0,
            max_total_memory_gb: 16.0,
            max_memory_percent: 0.75,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub enabled: bool,
    /// Target number of unclaimed pre-warmed workloads.
    pub init_containers: u32,
    /// Ceiling on total live workloads, claimed or not.
    pub max_containers: u32,
    /// Workloads spawned at most per maintenance pass.
    pub batch_size: u32,
    pub resources: PoolResourceSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            init_containers: 2,
            max_containers: 10,
            batch_size: 3,
            resources: PoolResourceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub enabled: bool,
    pub path: String,
    /// Supports ${GUAC_USERNAME}, ${GUAC_DATE}, ${GUAC_TIME}.
    pub name: String,
    pub include_keys: bool,
    pub auto_create_path: bool,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/recordings".into(),
            name: "${GUAC_USERNAME}-${GUAC_DATE}-${GUAC_TIME}".into(),
            include_keys: false,
            auto_create_path: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuacamoleSettings {
    pub url: String,
    pub admin_user: String,
    /// Never read from YAML; overlaid from GUACAMOLE_ADMIN_PASSWORD.
    #[serde(skip)]
    pub admin_password: String,
    /// Create a placeholder entry so the gateway shows its home page.
    pub force_home_page: bool,
    pub home_connection_name: String,
    pub recording: RecordingSettings,
}

impl Default for GuacamoleSettings {
    fn default() -> Self {
        Self {
            url: "http://guacamole:8080/guacamole".into(),
            admin_user: "guacadmin".into(),
            admin_password: String::new(),
            force_home_page: true,
            home_connection_name: "Home".into(),
            recording: RecordingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Overridable via DATABASE_URL.
    pub url: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:broker.db?mode=rwc".into(),
            pool_min: 2,
            pool_max: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Root of the per-user profile tree on the shared volume.
    pub data_root: PathBuf,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/user-data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Root settings value mirroring `broker.yml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sync: SyncSettings,
    pub orchestrator: OrchestratorSettings,
    pub containers: ContainersSettings,
    pub lifecycle: LifecycleSettings,
    pub pool: PoolSettings,
    pub guacamole: GuacamoleSettings,
    pub database: DatabaseSettings,
    pub profile: ProfileSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Config directory from the environment, or the packaged default.
    pub fn config_dir() -> PathBuf {
        std::env::var(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
    }

    /// Load settings from `<dir>/broker.yml`, falling back to defaults when
    /// the file does not exist, then overlay env secrets and validate.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(BROKER_CONFIG_FILE);
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let parsed = Self::from_yaml(&raw)?;
            info!("loaded broker config from {}", path.display());
            parsed
        } else {
            info!(
                "broker config not found at {}, using defaults",
                path.display()
            );
            Settings::default()
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Path of the profiles file next to `broker.yml`.
    pub fn profiles_path(config_dir: &Path) -> PathBuf {
        config_dir.join(PROFILES_CONFIG_FILE)
    }

    /// Secrets and deployment overrides come from the environment, never
    /// from the YAML file.
    fn apply_env(&mut self) {
        if let Ok(pw) = std::env::var("GUACAMOLE_ADMIN_PASSWORD") {
            self.guacamole.admin_password = pw;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(vol) = std::env::var("USER_PROFILES_VOLUME") {
            self.containers.user_data_volume = vol;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.guacamole.admin_password.is_empty() {
            return Err(BrokerError::Configuration(
                "GUACAMOLE_ADMIN_PASSWORD is required".into(),
            ));
        }
        if self.database.pool_min > self.database.pool_max || self.database.pool_max == 0 {
            return Err(BrokerError::Configuration(format!(
                "invalid database pool bounds: min={} max={}",
                self.database.pool_min, self.database.pool_max
            )));
        }
        let pct = self.pool.resources.max_memory_percent;
        if !(0.0..=1.0).contains(&pct) {
            return Err(BrokerError::Configuration(format!(
                "pool.resources.max_memory_percent must be within [0, 1], got {pct}"
            )));
        }
        if self.lifecycle.poll_interval == 0 {
            return Err(BrokerError::Configuration(
                "lifecycle.poll_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// Network the workloads attach to; the docker backend may override the
    /// shared container setting.
    pub fn workload_network(&self) -> &str {
        if self.orchestrator.docker.network.is_empty() {
            &self.containers.network
        } else {
            &self.orchestrator.docker.network
        }
    }
}
