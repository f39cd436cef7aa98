// # Provisioner
//
// Turns a gateway username into a ready session: claim a pre-warmed pool
// workload when one exists, spawn otherwise, then wire the catalog entry.
// Also hosts the connection start/end handlers the observer fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{EffectiveProfile, Settings};
use crate::domain::{generate_vnc_password, new_session_id, now_epoch, Session, VNC_PORT};
use crate::error::{BrokerError, Result};
use crate::gateway::GatewayApi;
use crate::monitoring::BrokerMetrics;
use crate::orchestrator::{wait_for_port, Orchestrator, PoolWorkload, WorkloadInfo, WorkloadSpec};
use crate::profile::UserProfiles;
use crate::store::SessionStore;

pub struct Provisioner {
    settings: Arc<Settings>,
    store: SessionStore,
    gateway: Arc<dyn GatewayApi>,
    orchestrator: Arc<dyn Orchestrator>,
    profiles: Arc<UserProfiles>,
    metrics: Arc<BrokerMetrics>,
}

impl Provisioner {
    pub fn new(
        settings: Arc<Settings>,
        store: SessionStore,
        gateway: Arc<dyn GatewayApi>,
        orchestrator: Arc<dyn Orchestrator>,
        profiles: Arc<UserProfiles>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
            orchestrator,
            profiles,
            metrics,
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.containers.vnc_timeout)
    }

    /// Provision a session for `username` and return its catalog entry id.
    pub async fn provision(&self, username: &str) -> Result<String> {
        match self.provision_inner(username).await {
            Err(BrokerError::Conflict(_)) => {
                // A concurrent provisioner won the unique-username race;
                // its session is authoritative. It may still be wiring the
                // catalog entry, so poll briefly before giving up.
                debug!("lost provisioning race for {username}, reading back");
                for _ in 0..20 {
                    if let Some(connection_id) = self
                        .store
                        .get_by_username(username)
                        .await?
                        .and_then(|s| s.gateway_connection_id)
                    {
                        return Ok(connection_id);
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(BrokerError::ProvisionFailed(format!(
                    "conflicting session for {username} has no catalog entry"
                )))
            }
            other => other,
        }
    }

    async fn provision_inner(&self, username: &str) -> Result<String> {
        if let Some(existing) = self.store.get_by_username(username).await? {
            return self.provision_existing(existing, username).await;
        }

        let profile = self.prepare_profile(username).await;

        let (mut session, workload, claimed) = match self.claim_from_pool(username).await? {
            Some((session, workload)) => (session, workload, true),
            None => {
                let (session, workload) = self.spawn_fresh(username, &profile).await?;
                (session, workload, false)
            }
        };

        if let Err(e) = wait_for_port(&workload.workload_ip, VNC_PORT, self.probe_timeout()).await {
            self.rollback(&session, &workload, claimed).await;
            return Err(BrokerError::ProvisionFailed(format!(
                "VNC not ready for {username}: {e}"
            )));
        }

        let password = session.vnc_password.clone().unwrap_or_default();
        let connection_id = match self
            .gateway
            .create_connection(
                &self.settings.containers.connection_name,
                &workload.workload_ip,
                VNC_PORT,
                &password,
                username,
            )
            .await
        {
            Ok(connection_id) => connection_id,
            Err(e) => {
                self.rollback(&session, &workload, claimed).await;
                return Err(e);
            }
        };
        if let Err(e) = self.gateway.grant_permission(username, &connection_id).await {
            let _ = self.gateway.delete_connection(&connection_id).await;
            self.rollback(&session, &workload, claimed).await;
            return Err(e);
        }
        if self.settings.guacamole.force_home_page {
            let _ = self.gateway.create_home_placeholder(username).await;
        }

        session.username = Some(username.to_string());
        session.gateway_connection_id = Some(connection_id.clone());
        session.started_at = Some(now_epoch());
        match self.store.save(&session).await {
            Ok(()) => {
                info!("connection provisioned for {username}: {connection_id}");
                Ok(connection_id)
            }
            Err(BrokerError::Conflict(msg)) => {
                warn!("provisioning conflict for {username}, rolling back {connection_id}");
                let _ = self.gateway.delete_connection(&connection_id).await;
                let _ = self.orchestrator.destroy(&workload.workload_id).await;
                Err(BrokerError::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Undo a half-finished provision attempt: destroy the workload and,
    /// for a claimed pool entry, delete the row so the user returns to the
    /// unprovisioned set instead of being stranded without a catalog entry.
    async fn rollback(&self, session: &Session, workload: &WorkloadInfo, claimed: bool) {
        let _ = self.orchestrator.destroy(&workload.workload_id).await;
        if claimed {
            let _ = self.store.delete(&session.session_id).await;
        }
    }

    /// An already-known user: reuse the live workload, or revive the
    /// session in place. Re-creating it would collide with the unique
    /// username index.
    async fn provision_existing(&self, mut session: Session, username: &str) -> Result<String> {
        let workload_alive = match (&session.workload_id, &session.workload_ip) {
            (Some(workload_id), Some(_)) => self.orchestrator.is_running(workload_id).await,
            _ => false,
        };
        if let (Some(connection_id), true) = (&session.gateway_connection_id, workload_alive) {
            debug!("reusing existing session for {username}");
            return Ok(connection_id.clone());
        }

        if !workload_alive {
            info!("previous workload for {username} is gone, spawning a new one");
            session.clear_workload();
            let profile = self.prepare_profile(username).await;
            let workload = self.respawn(&mut session, username, &profile).await?;
            if let Some(connection_id) = &session.gateway_connection_id {
                let password = session.vnc_password.clone().unwrap_or_default();
                self.gateway
                    .update_connection(connection_id, &workload.workload_ip, VNC_PORT, &password)
                    .await?;
            }
        }

        let connection_id = match session.gateway_connection_id.clone() {
            Some(connection_id) => connection_id,
            None => {
                // Session row without a catalog entry: an earlier attempt
                // stopped short. Finish the wiring now.
                let ip = session.workload_ip.clone().unwrap_or_default();
                let password = session.vnc_password.clone().unwrap_or_default();
                let connection_id = self
                    .gateway
                    .create_connection(
                        &self.settings.containers.connection_name,
                        &ip,
                        VNC_PORT,
                        &password,
                        username,
                    )
                    .await?;
                self.gateway.grant_permission(username, &connection_id).await?;
                session.gateway_connection_id = Some(connection_id.clone());
                connection_id
            }
        };

        self.store.save(&session).await?;
        info!("session revived for {username}: {connection_id}");
        Ok(connection_id)
    }

    /// Claim loop over pool candidates, oldest first. The store rows are
    /// reconciled against the orchestrator's own pool listing in one call;
    /// the CAS decides the winner for each candidate.
    async fn claim_from_pool(&self, username: &str) -> Result<Option<(Session, WorkloadInfo)>> {
        let candidates = self.store.list_pool().await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let live: HashMap<String, PoolWorkload> = self
            .orchestrator
            .list_pool()
            .await?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();

        for mut candidate in candidates {
            let Some(workload_id) = candidate.workload_id.clone() else {
                continue;
            };
            let Some(workload) = live.get(&workload_id) else {
                debug!(
                    "pool row {} has no live workload, skipping",
                    candidate.session_id
                );
                continue;
            };
            if !self
                .orchestrator
                .claim_labels(&workload_id, username)
                .await
                .unwrap_or(false)
            {
                continue;
            }
            match self.store.claim_pool(&candidate.session_id, username).await {
                Ok(true) => {
                    info!(
                        "claimed pool workload {workload_id} for {username} (session {})",
                        candidate.session_id
                    );
                    let ip = if workload.ip.is_empty() {
                        candidate.workload_ip.clone().unwrap_or_default()
                    } else {
                        workload.ip.clone()
                    };
                    candidate.username = Some(username.to_string());
                    candidate.workload_ip = Some(ip.clone());
                    return Ok(Some((
                        candidate,
                        WorkloadInfo {
                            workload_id,
                            workload_ip: ip,
                        },
                    )));
                }
                Ok(false) => {
                    debug!(
                        "lost claim race on pool session {}, trying next",
                        candidate.session_id
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn spawn_fresh(
        &self,
        username: &str,
        profile: &EffectiveProfile,
    ) -> Result<(Session, WorkloadInfo)> {
        let session_id = new_session_id();
        let password = generate_vnc_password();
        let spec = WorkloadSpec::claimed(
            session_id.clone(),
            username.to_string(),
            password.clone(),
            profile.homepage_or_blank().to_string(),
        );
        let workload = self.orchestrator.spawn(&spec).await?;
        self.metrics.workloads_spawned.inc();

        let mut session = Session::new(session_id);
        session.vnc_password = Some(password);
        session.workload_id = Some(workload.workload_id.clone());
        session.workload_ip = Some(workload.workload_ip.clone());
        Ok((session, workload))
    }

    /// Spawn a workload into an existing session, probing before the
    /// session is updated.
    async fn respawn(
        &self,
        session: &mut Session,
        username: &str,
        profile: &EffectiveProfile,
    ) -> Result<WorkloadInfo> {
        let password = session
            .vnc_password
            .clone()
            .unwrap_or_else(generate_vnc_password);
        session.vnc_password = Some(password.clone());
        let spec = WorkloadSpec::claimed(
            session.session_id.clone(),
            username.to_string(),
            password,
            profile.homepage_or_blank().to_string(),
        );
        let workload = self.orchestrator.spawn(&spec).await?;
        if let Err(e) = wait_for_port(&workload.workload_ip, VNC_PORT, self.probe_timeout()).await {
            let _ = self.orchestrator.destroy(&workload.workload_id).await;
            return Err(BrokerError::ProvisionFailed(format!(
                "VNC not ready for {username}: {e}"
            )));
        }
        session.workload_id = Some(workload.workload_id.clone());
        session.workload_ip = Some(workload.workload_ip.clone());
        session.started_at = Some(now_epoch());
        // Record the workload before any catalog wiring so a failure
        // further down never leaves it untracked.
        self.store.save(session).await?;
        self.metrics.workloads_spawned.inc();
        Ok(workload)
    }

    /// Profile directory and group config. Failures are logged, never
    /// fatal: a session without bookmarks beats no session.
    async fn prepare_profile(&self, username: &str) -> EffectiveProfile {
        if let Err(e) = self.profiles.ensure_profile(username) {
            warn!("could not ensure profile for {username}: {e}");
        }
        let groups = match self.gateway.user_groups(username).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!("unable to get groups for {username}: {e}");
                Vec::new()
            }
        };
        let profile = self.profiles.effective_config(username, &groups);
        info!(
            "configuration applied for {username}, groups: {:?}",
            profile.groups
        );
        profile
    }

    /// Connection start handler. Reuses a live workload, respawns a dead
    /// one and points the catalog entry at the new address.
    pub async fn on_connection_start(&self, connection_id: &str, username: &str) -> Result<bool> {
        let Some(mut session) = self.store.get_by_connection(connection_id).await? else {
            debug!("start for unknown connection {connection_id}");
            return Ok(false);
        };

        if let Some(workload_id) = &session.workload_id {
            if self.orchestrator.is_running(workload_id).await {
                info!("reusing existing workload for {username}");
                return Ok(true);
            }
            info!("previous workload for {username} no longer running, spawning a new one");
            session.clear_workload();
        }

        let profile = self.prepare_profile(username).await;
        let workload = self.respawn(&mut session, username, &profile).await?;
        let password = session.vnc_password.clone().unwrap_or_default();
        self.gateway
            .update_connection(connection_id, &workload.workload_ip, VNC_PORT, &password)
            .await?;
        self.store.save(&session).await?;
        info!(
            "workload started for {username} at {}",
            workload.workload_ip
        );
        Ok(true)
    }

    /// Connection end handler. Keeps the workload and stamps activity in
    /// persist mode, destroys it otherwise.
    pub async fn on_connection_end(&self, connection_id: &str) -> Result<()> {
        let Some(mut session) = self.store.get_by_connection(connection_id).await? else {
            return Ok(());
        };
        let username = session.username.clone().unwrap_or_else(|| "unknown".into());

        if self.settings.lifecycle.persist_after_disconnect {
            session.last_activity = Some(now_epoch());
            self.store.save(&session).await?;
            info!("connection ended for {username}, workload kept running");
            return Ok(());
        }

        if let Some(workload_id) = session.workload_id.clone() {
            if let Err(e) = self.orchestrator.destroy(&workload_id).await {
                // Keep the fields; the idle sweep reconciles later.
                warn!("could not destroy workload for {username}: {e}");
                return Err(e);
            }
            session.clear_workload();
            self.store.save(&session).await?;
            self.metrics.workloads_destroyed.inc();
            info!("workload destroyed for {username}");
        }
        Ok(())
    }
}
