// # Service container
//
// All shared services, constructed once at startup and threaded explicitly
// through the background tasks. Loops receive a stop signal and a handle to
// what they need instead of reaching for globals.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ProfilesConfig, Settings};
use crate::error::Result;
use crate::gateway::{GatewayApi, GuacamoleClient};
use crate::lifecycle::LifecycleObserver;
use crate::monitoring::BrokerMetrics;
use crate::orchestrator::{build_orchestrator, Orchestrator};
use crate::pool::PoolManager;
use crate::profile::UserProfiles;
use crate::provision::Provisioner;
use crate::resilience::BreakerRegistry;
use crate::store::SessionStore;
use crate::sync::SyncService;

pub struct ServiceContainer {
    pub settings: Arc<Settings>,
    pub metrics: Arc<BrokerMetrics>,
    pub breakers: Arc<BreakerRegistry>,
    pub store: SessionStore,
    pub gateway: Arc<dyn GatewayApi>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub profiles: Arc<UserProfiles>,
    pub provisioner: Arc<Provisioner>,
    pub observer: Arc<LifecycleObserver>,
    pub pool: Arc<PoolManager>,
    pub sync: Arc<SyncService>,
}

impl ServiceContainer {
    /// Build the full production wiring. Store or orchestrator failures
    /// here are fatal.
    pub async fn build(settings: Arc<Settings>, profiles_config: ProfilesConfig) -> Result<Self> {
        let breakers = Arc::new(BreakerRegistry::with_defaults());
        let store = SessionStore::connect(&settings.database).await?;
        let gateway: Arc<dyn GatewayApi> = Arc::new(GuacamoleClient::new(
            Arc::clone(&settings),
            breakers.get_or_create("guacamole"),
        )?);
        let orchestrator = build_orchestrator(Arc::clone(&settings), &breakers).await?;
        Ok(Self::assemble(
            settings,
            profiles_config,
            breakers,
            store,
            gateway,
            orchestrator,
        ))
    }

    /// Wire the services around the given boundary implementations. Tests
    /// use this with in-process fakes.
    pub fn assemble(
        settings: Arc<Settings>,
        profiles_config: ProfilesConfig,
        breakers: Arc<BreakerRegistry>,
        store: SessionStore,
        gateway: Arc<dyn GatewayApi>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let metrics = Arc::new(BrokerMetrics::new());
        let profiles = Arc::new(UserProfiles::new(&settings, profiles_config));
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&settings),
            store.clone(),
            Arc::clone(&gateway),
            Arc::clone(&orchestrator),
            Arc::clone(&profiles),
            Arc::clone(&metrics),
        ));
        let observer = Arc::new(LifecycleObserver::new(
            Arc::clone(&settings),
            store.clone(),
            Arc::clone(&gateway),
            Arc::clone(&orchestrator),
            Arc::clone(&provisioner),
            Arc::clone(&metrics),
        ));
        let pool = Arc::new(PoolManager::new(
            Arc::clone(&settings),
            store.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&observer),
            Arc::clone(&metrics),
        ));
        let sync = Arc::new(SyncService::new(
            Arc::clone(&settings),
            store.clone(),
            Arc::clone(&gateway),
            Arc::clone(&provisioner),
            Arc::clone(&pool),
            Arc::clone(&metrics),
        ));
        Self {
            settings,
            metrics,
            breakers,
            store,
            gateway,
            orchestrator,
            profiles,
            provisioner,
            observer,
            pool,
            sync,
        }
    }

    /// Startup passes that run once before the loops take over.
    pub async fn run_startup_tasks(&self) {
        if let Err(e) = self.pool.maintain().await {
            error!("startup pool initialization error: {e}");
        }
    }

    /// Spawn the long-lived background tasks. Each observes the shutdown
    /// channel between iterations and drains within one tick.
    pub fn start_background_tasks(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let observer = Arc::clone(&self.observer);
        let observer_rx = shutdown.subscribe();
        let observer_task = tokio::spawn(async move {
            observer.run(observer_rx).await;
        });

        let sync = Arc::clone(&self.sync);
        let sync_rx = shutdown.subscribe();
        let sync_task = tokio::spawn(async move {
            sync.run(sync_rx).await;
        });

        info!("background tasks started");
        vec![observer_task, sync_task]
    }
}
