// # Session broker server
//
// Startup order: configuration (fatal on error), logging, profiles, the
// service container (store migrations + orchestrator + gateway client),
// one pool pass, then the background loops until SIGINT.

use std::sync::Arc;
use std::time::Duration;

use session_broker::config::{ProfilesConfig, Settings};
use session_broker::services::ServiceContainer;
use session_broker::{Result, VERSION};
use tokio::sync::broadcast;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = Settings::config_dir();
    let settings = Arc::new(Settings::load(&config_dir)?);

    // Structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_max_level(log_level(&settings.logging.level))
        .init();

    info!("session broker {VERSION} starting");
    info!(
        "orchestrator backend: {:?}, pool target {}, sync every {}s",
        settings.orchestrator.backend, settings.pool.init_containers, settings.sync.interval
    );

    let profiles = ProfilesConfig::load(&Settings::profiles_path(&config_dir));
    let container = ServiceContainer::build(Arc::clone(&settings), profiles).await?;

    container.run_startup_tasks().await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = container.start_background_tasks(&shutdown_tx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping background tasks");
    let _ = shutdown_tx.send(());
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
    }
    info!("session broker stopped");
    Ok(())
}

fn log_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
