// # Workload pool manager
//
// Keeps a target number of pre-warmed, unclaimed workloads available so
// provisioning can claim instead of spawning. Bounded per pass by the batch
// size, the total-workload ceiling and the resource ceilings; runs once at
// startup and once per sync tick.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::{generate_vnc_password, new_session_id, now_epoch, Session, VNC_PORT};
use crate::error::Result;
use crate::lifecycle::LifecycleObserver;
use crate::monitoring::BrokerMetrics;
use crate::orchestrator::{wait_for_port, Orchestrator, WorkloadSpec};
use crate::store::SessionStore;

pub mod resources;

pub use resources::{MemoryReadings, ResourceCeilings};

pub struct PoolManager {
    settings: Arc<Settings>,
    store: SessionStore,
    orchestrator: Arc<dyn Orchestrator>,
    observer: Arc<LifecycleObserver>,
    ceilings: ResourceCeilings,
    metrics: Arc<BrokerMetrics>,
}

impl PoolManager {
    pub fn new(
        settings: Arc<Settings>,
        store: SessionStore,
        orchestrator: Arc<dyn Orchestrator>,
        observer: Arc<LifecycleObserver>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let ceilings = ResourceCeilings::new(Arc::clone(&settings));
        Self {
            settings,
            store,
            orchestrator,
            observer,
            ceilings,
            metrics,
        }
    }

    /// One maintenance pass. Resource pressure stops the pass without
    /// failing it; per-slot spawn errors are logged and the pass moves on.
    pub async fn maintain(&self) -> Result<()> {
        let pool = &self.settings.pool;
        if !pool.enabled {
            return Ok(());
        }

        let live_count = self.orchestrator.running_count().await;
        let pool_count = self.orchestrator.list_pool().await?.len();

        let need = (pool.init_containers as i64 - pool_count as i64)
            .min(pool.max_containers as i64 - live_count as i64)
            .min(pool.batch_size as i64)
            .max(0);
        if need == 0 {
            debug!("pool at target ({pool_count} unclaimed, {live_count} live)");
            return Ok(());
        }
        debug!("pool below target: spawning up to {need} workloads");

        let mut started = 0;
        for _ in 0..need {
            if let Err(reason) = self.ensure_capacity().await {
                warn!("pool maintenance stopped: {reason}");
                break;
            }
            match self.spawn_pool_entry().await {
                Ok(session_id) => {
                    started += 1;
                    info!("pre-warmed workload ready (session {session_id}, {started}/{need})");
                }
                Err(e) => warn!("pool spawn error: {e}"),
            }
        }
        if started > 0 {
            info!("pool maintenance: {started} workloads started");
        }
        Ok(())
    }

    /// Check the resource ceilings, evicting the single oldest idle
    /// workload first when configured to.
    async fn ensure_capacity(&self) -> std::result::Result<(), String> {
        match self.ceilings.check(&self.orchestrator).await {
            Ok(()) => Ok(()),
            Err(reason) => {
                if !self.settings.lifecycle.force_kill_on_low_resources {
                    return Err(reason);
                }
                warn!("resource pressure ({reason}), evicting oldest idle workload");
                let killed = self.observer.force_kill_oldest_inactive(1).await;
                if killed == 0 {
                    return Err(reason);
                }
                self.ceilings.check(&self.orchestrator).await
            }
        }
    }

    async fn spawn_pool_entry(&self) -> Result<String> {
        let session_id = new_session_id();
        let password = generate_vnc_password();
        let spec = WorkloadSpec::pool(session_id.clone(), password.clone());

        let info = self.orchestrator.spawn(&spec).await?;
        let probe_timeout = std::time::Duration::from_secs(self.settings.containers.vnc_timeout);
        if let Err(e) = wait_for_port(&info.workload_ip, VNC_PORT, probe_timeout).await {
            let _ = self.orchestrator.destroy(&info.workload_id).await;
            return Err(e);
        }

        let mut session = Session::new(session_id.clone());
        session.vnc_password = Some(password);
        session.workload_id = Some(info.workload_id.clone());
        session.workload_ip = Some(info.workload_ip);
        session.started_at = Some(now_epoch());
        if let Err(e) = self.store.save(&session).await {
            // A pool entry that cannot be recorded is unclaimable.
            let _ = self.orchestrator.destroy(&info.workload_id).await;
            return Err(e);
        }
        self.metrics.workloads_spawned.inc();
        Ok(session_id)
    }
}
