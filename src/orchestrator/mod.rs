// # Workload orchestration
//
// One process-wide orchestrator spawns, inspects, labels and destroys VNC
// workloads. Two backends implement the same contract: the local container
// daemon and a Kubernetes cluster. The backend is selected once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{OrchestratorBackend, Settings};
use crate::error::Result;
use crate::resilience::BreakerRegistry;

pub mod docker;
pub mod kubernetes;
pub mod probe;

pub use docker::DockerOrchestrator;
pub use kubernetes::KubernetesOrchestrator;
pub use probe::wait_for_port;

/// Labels stamped on every managed workload.
pub const LABEL_MANAGED: &str = "guac.managed";
pub const LABEL_SESSION_ID: &str = "guac.session.id";
pub const LABEL_POOL: &str = "guac.pool";
pub const LABEL_USERNAME: &str = "guac.username";

const GIB: u64 = 1024 * 1024 * 1024;

/// What to spawn. A spec without a username produces an unclaimed pool
/// workload.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub session_id: String,
    pub username: Option<String>,
    pub vnc_password: String,
    pub starting_url: String,
}

impl WorkloadSpec {
    pub fn pool(session_id: String, vnc_password: String) -> Self {
        Self {
            session_id,
            username: None,
            vnc_password,
            starting_url: "about:blank".into(),
        }
    }

    pub fn claimed(
        session_id: String,
        username: String,
        vnc_password: String,
        starting_url: String,
    ) -> Self {
        Self {
            session_id,
            username: Some(username),
            vnc_password,
            starting_url,
        }
    }

    /// Container/pod name derived from the session.
    pub fn workload_name(&self) -> String {
        format!("vnc-{}", self.session_id)
    }

    /// Environment consumed by the VNC image.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("VNC_PW".into(), self.vnc_password.clone()),
            ("VNC_RESOLUTION".into(), "1920x1080".into()),
            ("VNC_COL_DEPTH".into(), "24".into()),
            ("STARTING_URL".into(), self.starting_url.clone()),
        ];
        if let Some(username) = &self.username {
            env.push(("GUAC_USERNAME".into(), username.clone()));
        }
        env
    }

    /// Management labels; claimed workloads additionally carry the owner.
    pub fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_SESSION_ID.to_string(), self.session_id.clone()),
            (
                LABEL_POOL.to_string(),
                if self.username.is_none() {
                    "true".to_string()
                } else {
                    "false".to_string()
                },
            ),
        ]);
        if let Some(username) = &self.username {
            labels.insert(LABEL_USERNAME.to_string(), username.clone());
        }
        labels
    }
}

/// A spawned workload: orchestrator-assigned id plus its routable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub workload_id: String,
    pub workload_ip: String,
}

/// Listing entry for any managed workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedWorkload {
    pub id: String,
    pub name: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Listing entry for an unclaimed pool workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolWorkload {
    pub id: String,
    pub session_id: String,
    pub ip: String,
}

/// Contract both backends implement.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create a workload and block until it has an address.
    async fn spawn(&self, spec: &WorkloadSpec) -> Result<WorkloadInfo>;

    /// Graceful stop then removal. A missing workload is success.
    async fn destroy(&self, workload_id: &str) -> Result<()>;

    /// Missing workloads report false. Transient API errors report true:
    /// an unknown workload is assumed alive and reconciled on the next
    /// sweep rather than respawned on a hiccup.
    async fn is_running(&self, workload_id: &str) -> bool;

    /// All workloads carrying the managed label, any state.
    async fn list_managed(&self) -> Result<Vec<ManagedWorkload>>;

    /// Count of live managed workloads; 0 when the backend is unreachable.
    async fn running_count(&self) -> usize;

    /// Memory consumed by live managed workloads, in GB.
    async fn memory_used_gb(&self) -> f64;

    /// Live, unclaimed pool workloads. The backend already knows which
    /// workloads exist, so this is a single listing call.
    async fn list_pool(&self) -> Result<Vec<PoolWorkload>>;

    /// Re-label a pool workload as claimed. Backends that cannot mutate
    /// labels of live workloads report success; the session-store CAS is
    /// the source of truth either way.
    async fn claim_labels(&self, workload_id: &str, username: &str) -> Result<bool>;
}

/// Build the configured backend.
pub async fn build_orchestrator(
    settings: Arc<Settings>,
    breakers: &BreakerRegistry,
) -> Result<Arc<dyn Orchestrator>> {
    match settings.orchestrator.backend {
        OrchestratorBackend::Docker => Ok(Arc::new(DockerOrchestrator::new(
            settings,
            breakers.get_or_create("docker"),
        )?)),
        OrchestratorBackend::Kubernetes => Ok(Arc::new(
            KubernetesOrchestrator::connect(settings, breakers.get_or_create("kubernetes")).await?,
        )),
    }
}

/// Parse a memory limit into bytes. Accepts daemon-style suffixes
/// (`512m`, `2g`) and Kubernetes quantities (`512Mi`, `2Gi`, `2G`); bare
/// numbers are bytes. Unparsable input falls back to 1 GiB.
pub fn parse_memory_limit(value: &str) -> u64 {
    let value = value.trim();
    let binary: [(&str, u64); 4] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
    ];
    for (suffix, mult) in binary {
        if let Some(num) = value.strip_suffix(suffix) {
            if let Ok(n) = num.trim().parse::<f64>() {
                return (n * mult as f64) as u64;
            }
        }
    }
    if let Some(last) = value.chars().last() {
        let mult = match last.to_ascii_lowercase() {
            'k' => Some(1u64 << 10),
            'm' => Some(1 << 20),
            'g' => Some(1 << 30),
            't' => Some(1 << 40),
            _ => None,
        };
        if let Some(mult) = mult {
            if let Ok(n) = value[..value.len() - 1].trim().parse::<f64>() {
                return (n * mult as f64) as u64;
            }
        }
    }
    value.parse::<u64>().unwrap_or(GIB)
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_parsing() {
        assert_eq!(parse_memory_limit("1g"), 1 << 30);
        assert_eq!(parse_memory_limit("2G"), 2 << 30);
        assert_eq!(parse_memory_limit("512m"), 512 << 20);
        assert_eq!(parse_memory_limit("128M"), 128 << 20);
        assert_eq!(parse_memory_limit("2Gi"), 2 << 30);
        assert_eq!(parse_memory_limit("512Mi"), 512 << 20);
        assert_eq!(parse_memory_limit("1024"), 1024);
        // unparsable falls back to 1 GiB
        assert_eq!(parse_memory_limit("plenty"), GIB);
        assert_eq!(parse_memory_limit(""), GIB);
    }

    #[test]
    fn pool_spec_labels_and_env() {
        let spec = WorkloadSpec::pool("abc123".into(), "secret".into());
        assert_eq!(spec.workload_name(), "vnc-abc123");
        let labels = spec.labels();
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_POOL], "true");
        assert_eq!(labels[LABEL_SESSION_ID], "abc123");
        assert!(!labels.contains_key(LABEL_USERNAME));
        let env = spec.environment();
        assert!(env.contains(&("VNC_PW".into(), "secret".into())));
        assert!(env.contains(&("STARTING_URL".into(), "about:blank".into())));
        assert!(!env.iter().any(|(k, _)| k == "GUAC_USERNAME"));
    }

    #[test]
    fn claimed_spec_labels_and_env() {
        let spec = WorkloadSpec::claimed(
            "abc123".into(),
            "alice".into(),
            "secret".into(),
            "https://example.com".into(),
        );
        let labels = spec.labels();
        assert_eq!(labels[LABEL_POOL], "false");
        assert_eq!(labels[LABEL_USERNAME], "alice");
        let env = spec.environment();
        assert!(env.contains(&("GUAC_USERNAME".into(), "alice".into())));
        assert!(env.contains(&("STARTING_URL".into(), "https://example.com".into())));
    }
}
