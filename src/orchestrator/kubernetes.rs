// # Cluster backend
//
// One pod per workload in a configured namespace. Pods are labeled the same
// way the daemon backend labels containers; claims patch the pool labels in
// place. Spawning waits for the scheduler to assign a pod IP, which can
// take considerably longer than the local daemon.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Api;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::VNC_PORT;
use crate::error::{BrokerError, Result};
use crate::orchestrator::{
    bytes_to_gb, parse_memory_limit, ManagedWorkload, Orchestrator, PoolWorkload, WorkloadInfo,
    WorkloadSpec, LABEL_MANAGED, LABEL_POOL, LABEL_SESSION_ID, LABEL_USERNAME,
};
use crate::resilience::CircuitBreaker;

/// Scheduling can take a while on a busy cluster.
const IP_WAIT: Duration = Duration::from_secs(60);
const IP_POLL: Duration = Duration::from_secs(1);
const DELETE_GRACE_SECS: u32 = 10;

pub struct KubernetesOrchestrator {
    pods: Api<Pod>,
    settings: Arc<Settings>,
    breaker: Arc<CircuitBreaker>,
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

fn api_error(err: kube::Error) -> BrokerError {
    match err {
        kube::Error::Api(response) => BrokerError::Upstream {
            status: response.code,
            body: response.message,
        },
        other => BrokerError::Orchestrator(other.to_string()),
    }
}

impl KubernetesOrchestrator {
    /// Connect using in-cluster credentials, falling back to the local
    /// kubeconfig.
    pub async fn connect(settings: Arc<Settings>, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| BrokerError::Orchestrator(format!("cluster config: {e}")))?;
        let namespace = settings.orchestrator.kubernetes.namespace.clone();
        info!("cluster orchestrator using namespace {namespace}");
        Ok(Self {
            pods: Api::namespaced(client, &namespace),
            settings,
            breaker,
        })
    }

    fn pod_manifest(&self, spec: &WorkloadSpec) -> Result<Pod> {
        let k8s = &self.settings.orchestrator.kubernetes;

        let mut labels = spec.labels();
        for (k, v) in &k8s.labels {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let env: Vec<serde_json::Value> = spec
            .environment()
            .into_iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        let container = json!({
            "name": "vnc",
            "image": self.settings.containers.image,
            "imagePullPolicy": k8s.image_pull_policy,
            "env": env,
            "ports": [{"containerPort": VNC_PORT, "name": "vnc", "protocol": "TCP"}],
            "resources": {
                "requests": {
                    "memory": k8s.resources.requests.memory,
                    "cpu": k8s.resources.requests.cpu,
                },
                "limits": {
                    "memory": k8s.resources.limits.memory,
                    "cpu": k8s.resources.limits.cpu,
                },
            },
            "securityContext": {
                "runAsNonRoot": k8s.security_context.run_as_non_root,
                "runAsUser": k8s.security_context.run_as_user,
            },
        });
        let mut pod_spec = serde_json::Map::new();
        pod_spec.insert("containers".into(), json!([container]));
        pod_spec.insert("restartPolicy".into(), json!("Never"));
        if !k8s.node_selector.is_empty() {
            pod_spec.insert("nodeSelector".into(), json!(k8s.node_selector));
        }
        if !k8s.tolerations.is_empty() {
            pod_spec.insert("tolerations".into(), json!(k8s.tolerations));
        }
        if !k8s.image_pull_secrets.is_empty() {
            let secrets: Vec<serde_json::Value> = k8s
                .image_pull_secrets
                .iter()
                .map(|name| json!({"name": name}))
                .collect();
            pod_spec.insert("imagePullSecrets".into(), json!(secrets));
        }
        if !k8s.service_account.is_empty() {
            pod_spec.insert("serviceAccountName".into(), json!(k8s.service_account));
        }

        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": spec.workload_name(),
                "namespace": k8s.namespace,
                "labels": labels,
            },
            "spec": pod_spec,
        });
        Ok(serde_json::from_value(manifest)?)
    }

    async fn wait_for_pod_ip(&self, pod_name: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + IP_WAIT;
        loop {
            let pod = self
                .breaker
                .call(async { self.pods.get_opt(pod_name).await.map_err(api_error) })
                .await;
            match pod {
                Ok(Some(pod)) => {
                    if let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                        if !ip.is_empty() {
                            return Ok(ip);
                        }
                    }
                }
                Ok(None) => {
                    return Err(BrokerError::SpawnFailed(format!(
                        "pod {pod_name} vanished while waiting for an address"
                    )))
                }
                Err(e) => warn!("error reading pod {pod_name}: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::SpawnFailed(format!(
                    "pod {pod_name} got no IP within {IP_WAIT:?}"
                )));
            }
            tokio::time::sleep(IP_POLL).await;
        }
    }

    async fn list_labeled(&self, selector: &str, running_only: bool) -> Result<Vec<Pod>> {
        let mut params = ListParams::default().labels(selector);
        if running_only {
            params = params.fields("status.phase=Running");
        }
        let pods = self
            .breaker
            .call(async { self.pods.list(&params).await.map_err(api_error) })
            .await?;
        Ok(pods.items)
    }
}

fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "unknown".into())
}

fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

#[async_trait::async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn spawn(&self, spec: &WorkloadSpec) -> Result<WorkloadInfo> {
        let pod_name = spec.workload_name();
        let manifest = self.pod_manifest(spec)?;

        let created = self
            .breaker
            .call(async {
                self.pods
                    .create(&PostParams::default(), &manifest)
                    .await
                    .map_err(api_error)
            })
            .await;
        match created {
            Ok(_) => info!("created pod {pod_name}"),
            Err(BrokerError::Upstream { status: 409, .. }) => {
                warn!("pod {pod_name} already exists, reusing");
            }
            Err(e) => return Err(BrokerError::SpawnFailed(format!("create pod: {e}"))),
        }

        match self.wait_for_pod_ip(&pod_name).await {
            Ok(ip) => {
                info!("pod {pod_name} started with IP {ip}");
                Ok(WorkloadInfo {
                    workload_id: pod_name,
                    workload_ip: ip,
                })
            }
            Err(e) => {
                // A pod that never got an address stays unreachable; remove
                // it so the next attempt starts clean.
                let _ = self.destroy(&pod_name).await;
                Err(e)
            }
        }
    }

    async fn destroy(&self, workload_id: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(DELETE_GRACE_SECS),
            ..DeleteParams::default()
        };
        let result = self
            .breaker
            .call(async {
                match self.pods.delete(workload_id, &params).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_status(&e, 404) => Ok(()),
                    Err(e) => Err(api_error(e)),
                }
            })
            .await;
        match result {
            Ok(()) => {
                info!("pod {workload_id} deleted");
                Ok(())
            }
            Err(e) => {
                warn!("error deleting pod {workload_id}: {e}");
                Err(e)
            }
        }
    }

    async fn is_running(&self, workload_id: &str) -> bool {
        let pod = self
            .breaker
            .call(async { self.pods.get_opt(workload_id).await.map_err(api_error) })
            .await;
        match pod {
            Ok(Some(pod)) => pod_phase(&pod) == "Running",
            Ok(None) => false,
            Err(e) => {
                warn!("error checking pod {workload_id}: {e}; assuming alive");
                true
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedWorkload>> {
        let selector = format!("{LABEL_MANAGED}=true");
        let pods = self.list_labeled(&selector, false).await?;
        Ok(pods
            .iter()
            .map(|pod| ManagedWorkload {
                id: pod_name(pod),
                name: pod_name(pod),
                status: pod_phase(pod).to_lowercase(),
                labels: pod.metadata.labels.clone().unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn running_count(&self) -> usize {
        let selector = format!("{LABEL_MANAGED}=true");
        match self.list_labeled(&selector, true).await {
            Ok(pods) => pods.len(),
            Err(e) => {
                warn!("error counting pods: {e}");
                0
            }
        }
    }

    async fn memory_used_gb(&self) -> f64 {
        // Estimate from the configured limit; precise per-pod usage needs a
        // metrics server.
        let selector = format!("{LABEL_MANAGED}=true");
        let count = match self.list_labeled(&selector, true).await {
            Ok(pods) => pods.len() as u64,
            Err(_) => return 0.0,
        };
        let resources = &self.settings.orchestrator.kubernetes.resources;
        let per_pod = if !resources.limits.memory.is_empty() {
            parse_memory_limit(&resources.limits.memory)
        } else {
            parse_memory_limit(&resources.requests.memory)
        };
        bytes_to_gb(per_pod * count)
    }

    async fn list_pool(&self) -> Result<Vec<PoolWorkload>> {
        let selector = format!("{LABEL_MANAGED}=true,{LABEL_POOL}=true");
        let pods = self.list_labeled(&selector, true).await?;
        Ok(pods
            .iter()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .map(|labels| !labels.contains_key(LABEL_USERNAME))
                    .unwrap_or(true)
            })
            .map(|pod| PoolWorkload {
                id: pod_name(pod),
                session_id: pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_SESSION_ID).cloned())
                    .unwrap_or_default(),
                ip: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn claim_labels(&self, workload_id: &str, username: &str) -> Result<bool> {
        let patch = json!({
            "metadata": {
                "labels": {
                    LABEL_POOL: "false",
                    LABEL_USERNAME: username,
                }
            }
        });
        let result = self
            .breaker
            .call(async {
                self.pods
                    .patch(workload_id, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(api_error)
            })
            .await;
        match result {
            Ok(_) => {
                info!("claimed pool pod {workload_id} for user {username}");
                Ok(true)
            }
            Err(e) => {
                warn!("error claiming pod {workload_id}: {e}");
                Ok(false)
            }
        }
    }
}
