// # Connection lifecycle observer
//
// One long-lived task polls the gateway's active connections, fires the
// start/end handlers on transitions, and periodically sweeps idle
// workloads. A single bad tick never stops the loop: errors are logged
// and the next tick starts fresh.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::domain::{now_epoch, Session};
use crate::error::Result;
use crate::monitoring::BrokerMetrics;
use crate::orchestrator::Orchestrator;
use crate::provision::Provisioner;
use crate::store::SessionStore;

pub struct LifecycleObserver {
    settings: Arc<Settings>,
    store: SessionStore,
    gateway: Arc<dyn crate::gateway::GatewayApi>,
    orchestrator: Arc<dyn Orchestrator>,
    provisioner: Arc<Provisioner>,
    metrics: Arc<BrokerMetrics>,
    /// Snapshot of the currently active connection ids, refreshed every
    /// tick for the sweep and force-evict eligibility checks. The tick's
    /// own previous-set lives on the task, not here.
    active: RwLock<HashSet<String>>,
}

impl LifecycleObserver {
    pub fn new(
        settings: Arc<Settings>,
        store: SessionStore,
        gateway: Arc<dyn crate::gateway::GatewayApi>,
        orchestrator: Arc<dyn Orchestrator>,
        provisioner: Arc<Provisioner>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
            orchestrator,
            provisioner,
            metrics,
            active: RwLock::new(HashSet::new()),
        }
    }

    pub fn active_snapshot(&self) -> HashSet<String> {
        self.active.read().clone()
    }

    /// Observer loop. Runs until the stop signal fires; the signal is
    /// observed between iterations so shutdown drains within one tick.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let poll = Duration::from_secs(self.settings.lifecycle.poll_interval);
        let cleanup_every = self.settings.lifecycle.cleanup_every_ticks.max(1);
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "connection observer started (poll {poll:?}, sweep every {cleanup_every} ticks)"
        );
        let mut previous: HashSet<String> = HashSet::new();
        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("connection observer stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.tick(&mut previous).await {
                error!("observer tick error: {e}");
            }

            ticks += 1;
            if ticks >= cleanup_every {
                ticks = 0;
                if let Err(e) = self.sweep_idle().await {
                    error!("idle sweep error: {e}");
                }
            }
        }
    }

    /// One poll: diff the active set against the previous tick, handle
    /// starts before ends, then refresh the snapshot and gauges.
    pub async fn tick(&self, previous: &mut HashSet<String>) -> Result<()> {
        let active = self.gateway.list_active_connections().await?;
        let current: HashSet<String> = active
            .values()
            .filter_map(|c| c.connection_id.clone())
            .collect();

        for connection_id in current.difference(previous) {
            let username = active
                .values()
                .find(|c| c.connection_id.as_deref() == Some(connection_id))
                .and_then(|c| c.username.clone())
                .unwrap_or_else(|| "unknown".into());
            debug!("connection {connection_id} started (user {username})");
            if let Err(e) = self
                .provisioner
                .on_connection_start(connection_id, &username)
                .await
            {
                error!("start handler error for {connection_id}: {e}");
            }
        }

        for connection_id in previous.difference(&current) {
            debug!("connection {connection_id} ended");
            if let Err(e) = self.provisioner.on_connection_end(connection_id).await {
                error!("end handler error for {connection_id}: {e}");
            }
        }

        *previous = current.clone();
        *self.active.write() = current;

        self.metrics
            .active_connections
            .set(previous.len() as f64);
        self.metrics
            .running_workloads
            .set(self.orchestrator.running_count().await as f64);
        if let Ok(pool) = self.orchestrator.list_pool().await {
            self.metrics.pool_workloads.set(pool.len() as f64);
        }
        Ok(())
    }

    /// Destroy workloads of claimed sessions that have sat idle past the
    /// configured timeout. Pool entries are the pool manager's to reap.
    pub async fn sweep_idle(&self) -> Result<()> {
        let timeout_minutes = self.settings.lifecycle.idle_timeout_minutes;
        if timeout_minutes <= 0 {
            return Ok(());
        }
        let timeout_secs = timeout_minutes * 60;
        let now = now_epoch();
        let active = self.active_snapshot();

        let mut cleaned = 0;
        for mut session in self.store.list().await? {
            if !Self::sweep_eligible(&session, &active) {
                continue;
            }
            let Some(reference) = session.idle_reference() else {
                continue;
            };
            let idle_secs = now - reference;
            if idle_secs <= timeout_secs {
                continue;
            }

            let username = session.username.clone().unwrap_or_default();
            let workload_id = session.workload_id.clone().unwrap_or_default();
            info!(
                "destroying idle workload for {username} (idle {:.1}min > {timeout_minutes}min)",
                idle_secs as f64 / 60.0
            );
            if let Err(e) = self.orchestrator.destroy(&workload_id).await {
                // Leave the fields in place; the next sweep retries.
                warn!("could not destroy workload {workload_id}: {e}");
                continue;
            }
            session.clear_workload();
            self.store.save(&session).await?;
            self.metrics.workloads_destroyed.inc();
            cleaned += 1;
        }
        if cleaned > 0 {
            info!("idle sweep: {cleaned} workloads destroyed");
        }
        Ok(())
    }

    fn sweep_eligible(session: &Session, active: &HashSet<String>) -> bool {
        if session.username.is_none() || session.workload_id.is_none() {
            return false;
        }
        match &session.gateway_connection_id {
            Some(connection_id) => !active.contains(connection_id),
            None => true,
        }
    }

    /// Destroy the `count` longest-idle claimed workloads regardless of
    /// the timeout. Called under resource pressure; returns how many were
    /// actually destroyed.
    pub async fn force_kill_oldest_inactive(&self, count: usize) -> usize {
        let sessions = match self.store.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("force kill error: {e}");
                return 0;
            }
        };
        let active = self.active_snapshot();
        let now = now_epoch();

        let mut eligible: Vec<(i64, Session)> = sessions
            .into_iter()
            .filter(|s| Self::sweep_eligible(s, &active))
            .map(|s| (s.idle_reference().unwrap_or(now), s))
            .collect();
        eligible.sort_by_key(|(reference, _)| *reference);

        let mut killed = 0;
        for (_, mut session) in eligible.into_iter().take(count) {
            let username = session.username.clone().unwrap_or_default();
            let workload_id = session.workload_id.clone().unwrap_or_default();
            warn!("force killing workload for {username} (low resources)");
            if self.orchestrator.destroy(&workload_id).await.is_err() {
                continue;
            }
            session.clear_workload();
            if let Err(e) = self.store.save(&session).await {
                error!("force kill bookkeeping error for {username}: {e}");
                continue;
            }
            self.metrics.workloads_destroyed.inc();
            killed += 1;
        }
        killed
    }
}
