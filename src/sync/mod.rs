// # User sync loop
//
// Reconciles the gateway's user directory against provisioned sessions:
// every interval, provision whoever is new, then let the pool manager top
// up. Per-user failures never abort the pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::Result;
use crate::gateway::GatewayApi;
use crate::monitoring::BrokerMetrics;
use crate::pool::PoolManager;
use crate::provision::Provisioner;
use crate::store::SessionStore;

/// Grace period before the first pass so collaborators finish booting.
const STARTUP_DELAY: Duration = Duration::from_secs(10);

pub struct SyncService {
    settings: Arc<Settings>,
    store: SessionStore,
    gateway: Arc<dyn GatewayApi>,
    provisioner: Arc<Provisioner>,
    pool: Arc<PoolManager>,
    metrics: Arc<BrokerMetrics>,
}

impl SyncService {
    pub fn new(
        settings: Arc<Settings>,
        store: SessionStore,
        gateway: Arc<dyn GatewayApi>,
        provisioner: Arc<Provisioner>,
        pool: Arc<PoolManager>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
            provisioner,
            pool,
            metrics,
        }
    }

    /// Sync loop. First pass runs after a short startup delay; the stop
    /// signal is observed between iterations.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
        }

        if self.settings.sync.sync_config_on_restart {
            self.sync_connection_configs().await;
        }

        let period = Duration::from_secs(self.settings.sync.interval.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("user sync started (interval {period:?})");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("user sync stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            match self.sync_users().await {
                Ok(new_users) if !new_users.is_empty() => {
                    info!("new users provisioned: {new_users:?}");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("sync error: {e}");
                    self.metrics.sync_errors.inc();
                }
            }

            if let Err(e) = self.pool.maintain().await {
                error!("pool maintenance error: {e}");
            }
        }
    }

    /// One reconciliation pass; returns the users provisioned this round.
    pub async fn sync_users(&self) -> Result<Vec<String>> {
        let ignored: HashSet<&str> = self
            .settings
            .sync
            .ignored_users
            .iter()
            .map(String::as_str)
            .collect();
        let users = self.gateway.list_users().await?;
        let provisioned = self.store.provisioned_usernames().await?;

        let mut new_users: Vec<String> = users
            .into_iter()
            .filter(|u| !ignored.contains(u.as_str()) && !provisioned.contains(u))
            .collect();
        new_users.sort();

        let mut result = Vec::new();
        for username in new_users {
            match self.provisioner.provision(&username).await {
                Ok(_) => {
                    self.metrics.users_synced.inc();
                    result.push(username);
                }
                Err(e) => {
                    error!("provisioning error for {username}: {e}");
                    self.metrics.sync_errors.inc();
                }
            }
        }
        Ok(result)
    }

    /// One-time startup pass rewriting catalog-entry parameters from the
    /// current config. Best-effort per entry.
    async fn sync_connection_configs(&self) {
        let sessions = match self.store.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("config sync skipped: {e}");
                return;
            }
        };
        let mut synced = 0;
        for session in sessions {
            let Some(connection_id) = &session.gateway_connection_id else {
                continue;
            };
            let username = session.username.as_deref().unwrap_or("");
            if self
                .gateway
                .sync_connection_config(connection_id, username)
                .await
            {
                synced += 1;
            }
        }
        info!("startup config sync: {synced} catalog entries updated");
    }
}
