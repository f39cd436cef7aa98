// # Local daemon backend
//
// Talks to the container daemon's HTTP API directly. Workloads are
// containers on a bridge network, labeled for discovery; the network is
// created on first use when missing. The daemon cannot relabel running
// containers, so pool claims are tracked solely by the session store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{BrokerError, Result};
use crate::orchestrator::{
    bytes_to_gb, parse_memory_limit, ManagedWorkload, Orchestrator, PoolWorkload, WorkloadInfo,
    WorkloadSpec, LABEL_MANAGED, LABEL_POOL, LABEL_SESSION_ID, LABEL_USERNAME,
};
use crate::resilience::CircuitBreaker;

const API_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for the daemon to assign an address after start.
const IP_WAIT: Duration = Duration::from_secs(10);
const IP_POLL: Duration = Duration::from_millis(500);
const STOP_GRACE_SECS: u32 = 10;

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, NetworkEndpoint>,
}

impl NetworkSettings {
    fn first_ip(&self) -> Option<&str> {
        self.networks
            .values()
            .map(|n| n.ip_address.as_str())
            .find(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    memory_stats: MemoryStats,
}

pub struct DockerOrchestrator {
    http: reqwest::Client,
    base_url: String,
    settings: Arc<Settings>,
    breaker: Arc<CircuitBreaker>,
}

impl DockerOrchestrator {
    pub fn new(settings: Arc<Settings>, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Orchestrator(format!("daemon client: {e}")))?;
        let base_url = settings.orchestrator.docker.host.trim_end_matches('/').to_string();
        info!("daemon orchestrator using {base_url}");
        Ok(Self {
            http,
            base_url,
            settings,
            breaker,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BrokerError::Upstream {
            status: status.as_u16(),
            body,
        })
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.breaker
            .call(async {
                let response = self.http.get(self.url(path)).query(query).send().await?;
                Ok(Self::check(response).await?.json::<T>().await?)
            })
            .await
    }

    async fn api_post(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        self.breaker
            .call(async {
                let mut request = self.http.post(self.url(path)).query(query);
                if let Some(body) = body {
                    request = request.json(&body);
                }
                Self::check(request.send().await?).await
            })
            .await
    }

    /// The workload network is created on demand.
    async fn ensure_network(&self) -> Result<String> {
        let network = self.settings.workload_network().to_string();
        let inspect = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .get(self.url(&format!("/networks/{network}")))
                    .send()
                    .await?;
                Ok(response.status())
            })
            .await?;
        if inspect == reqwest::StatusCode::NOT_FOUND {
            info!("creating workload network {network}");
            self.api_post(
                "/networks/create",
                &[],
                Some(json!({"Name": network, "Driver": "bridge"})),
            )
            .await?;
        }
        Ok(network)
    }

    /// `None` when the container does not exist. A 404 is a successful
    /// daemon interaction and never counts toward the breaker.
    async fn inspect(&self, container_id: &str) -> Result<Option<InspectResponse>> {
        self.breaker
            .call(async {
                let response = self
                    .http
                    .get(self.url(&format!("/containers/{container_id}/json")))
                    .send()
                    .await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                Ok(Some(Self::check(response).await?.json().await?))
            })
            .await
    }

    async fn list_containers(
        &self,
        filters: serde_json::Value,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let mut query = vec![("filters", filters.to_string())];
        if all {
            query.push(("all", "true".into()));
        }
        self.api_get("/containers/json", &query).await
    }

    async fn wait_for_address(&self, container_id: &str, network: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + IP_WAIT;
        loop {
            let inspect = self.inspect(container_id).await?.ok_or_else(|| {
                BrokerError::SpawnFailed(format!("container {container_id} vanished before start"))
            })?;
            if let Some(endpoint) = inspect.network_settings.networks.get(network) {
                if !endpoint.ip_address.is_empty() {
                    return Ok(endpoint.ip_address.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::SpawnFailed(format!(
                    "container {container_id} got no address on {network}"
                )));
            }
            tokio::time::sleep(IP_POLL).await;
        }
    }
}

#[async_trait::async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn spawn(&self, spec: &WorkloadSpec) -> Result<WorkloadInfo> {
        let network = self.ensure_network().await?;
        let containers = &self.settings.containers;

        let env: Vec<String> = spec
            .environment()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let body = json!({
            "Image": containers.image,
            "Env": env,
            "Labels": spec.labels(),
            "HostConfig": {
                "Memory": parse_memory_limit(&containers.memory_limit),
                "ShmSize": parse_memory_limit(&containers.shm_size),
                "NetworkMode": network,
                "Mounts": [{
                    "Target": "/user-data",
                    "Source": containers.user_data_volume,
                    "Type": "volume",
                    "ReadOnly": false
                }]
            }
        });

        let created: CreateResponse = self
            .api_post(
                "/containers/create",
                &[("name", spec.workload_name())],
                Some(body),
            )
            .await
            .map_err(|e| BrokerError::SpawnFailed(format!("create: {e}")))?
            .json()
            .await
            .map_err(|e| BrokerError::SpawnFailed(format!("create response: {e}")))?;

        if let Err(e) = self
            .api_post(&format!("/containers/{}/start", created.id), &[], None)
            .await
        {
            let _ = self.destroy(&created.id).await;
            return Err(BrokerError::SpawnFailed(format!("start: {e}")));
        }

        match self.wait_for_address(&created.id, &network).await {
            Ok(ip) => {
                info!(
                    "container {} started with IP {ip}",
                    &created.id[..12.min(created.id.len())]
                );
                Ok(WorkloadInfo {
                    workload_id: created.id,
                    workload_ip: ip,
                })
            }
            Err(e) => {
                let _ = self.destroy(&created.id).await;
                Err(e)
            }
        }
    }

    async fn destroy(&self, workload_id: &str) -> Result<()> {
        let short = &workload_id[..12.min(workload_id.len())];
        let stop = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .post(self.url(&format!("/containers/{workload_id}/stop")))
                    .query(&[("t", STOP_GRACE_SECS.to_string())])
                    .send()
                    .await?;
                Ok(response.status())
            })
            .await;
        match stop {
            Ok(status) if status == reqwest::StatusCode::NOT_FOUND => return Ok(()),
            // 304: already stopped
            Ok(status)
                if status.is_success() || status == reqwest::StatusCode::NOT_MODIFIED => {}
            Ok(status) => warn!("unexpected status {status} stopping container {short}"),
            Err(e) => warn!("error stopping container {short}: {e}"),
        }

        let remove = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .delete(self.url(&format!("/containers/{workload_id}")))
                    .query(&[("force", "true")])
                    .send()
                    .await?;
                Ok(response.status())
            })
            .await;
        match remove {
            Ok(status) if status.is_success() || status == reqwest::StatusCode::NOT_FOUND => {
                info!("container {short} destroyed");
                Ok(())
            }
            Ok(status) => {
                error!("error destroying container {short}: HTTP {status}");
                Err(BrokerError::Upstream {
                    status: status.as_u16(),
                    body: String::new(),
                })
            }
            Err(e) => {
                error!("error destroying container {short}: {e}");
                Err(e)
            }
        }
    }

    async fn is_running(&self, workload_id: &str) -> bool {
        match self.inspect(workload_id).await {
            Ok(Some(inspect)) => inspect.state.running,
            Ok(None) => false,
            Err(e) => {
                warn!("error checking container {workload_id}: {e}; assuming alive");
                true
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedWorkload>> {
        let filters = json!({"label": [format!("{LABEL_MANAGED}=true")]});
        let containers = self.list_containers(filters, true).await?;
        Ok(containers
            .into_iter()
            .map(|c| ManagedWorkload {
                name: c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| c.id.clone()),
                id: c.id,
                status: c.state,
                labels: c.labels,
            })
            .collect())
    }

    async fn running_count(&self) -> usize {
        let filters = json!({
            "label": [format!("{LABEL_MANAGED}=true")],
            "status": ["running"],
        });
        match self.list_containers(filters, false).await {
            Ok(containers) => containers.len(),
            Err(e) => {
                warn!("error counting containers: {e}");
                0
            }
        }
    }

    async fn memory_used_gb(&self) -> f64 {
        let filters = json!({
            "label": [format!("{LABEL_MANAGED}=true")],
            "status": ["running"],
        });
        let containers = match self.list_containers(filters, false).await {
            Ok(containers) => containers,
            Err(_) => return 0.0,
        };

        let mut total_bytes: u64 = 0;
        for container in &containers {
            let stats: Result<StatsResponse> = self
                .api_get(
                    &format!("/containers/{}/stats", container.id),
                    &[("stream", "false".into())],
                )
                .await;
            match stats {
                Ok(stats) if stats.memory_stats.usage > 0 => {
                    total_bytes += stats.memory_stats.usage;
                }
                // Estimate when stats are unavailable.
                _ => total_bytes += 1 << 30,
            }
        }
        bytes_to_gb(total_bytes)
    }

    async fn list_pool(&self) -> Result<Vec<PoolWorkload>> {
        let filters = json!({
            "label": [format!("{LABEL_MANAGED}=true"), format!("{LABEL_POOL}=true")],
            "status": ["running"],
        });
        let containers = self.list_containers(filters, false).await?;
        Ok(containers
            .into_iter()
            .filter(|c| !c.labels.contains_key(LABEL_USERNAME))
            .map(|c| PoolWorkload {
                session_id: c.labels.get(LABEL_SESSION_ID).cloned().unwrap_or_default(),
                ip: c
                    .network_settings
                    .first_ip()
                    .unwrap_or_default()
                    .to_string(),
                id: c.id,
            })
            .collect())
    }

    async fn claim_labels(&self, workload_id: &str, username: &str) -> Result<bool> {
        // The daemon cannot change labels on a running container; claiming
        // is decided by the session-store CAS alone.
        info!(
            "claimed pool container {} for user {username}",
            &workload_id[..12.min(workload_id.len())]
        );
        Ok(true)
    }
}
