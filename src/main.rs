use std::sync::Arc;

use acp2_bridge::app::registry::AgentRegistry;
use acp2_bridge::app::run_manager::RunManager;
use acp2_bridge::app::session_manager::SessionManager;
use acp2_bridge::config::Config;
use acp2_bridge::http::{self, AppState};
use acp2_bridge::infra::db::SessionStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    let store = SessionStore::open(&config.db_path).await?;
    let registry = Arc::new(AgentRegistry::load(&config.agents_config_path).await?);
    let workdir = std::env::current_dir()?;
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&registry),
        store.clone(),
        workdir,
        config.grace_period,
    ));
    let runs = RunManager::new(store.clone(), Arc::clone(&sessions), Arc::clone(&registry), config.persist_updates);

    let config = Arc::new(config);
    spawn_idle_reaper(Arc::clone(&sessions), config.idle_timeout);

    let state = AppState { config: Arc::clone(&config), registry, sessions, runs, store };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind((config.bind_addr, config.bind_port)).await?;
    tracing::info!(addr = %config.bind_addr, port = config.bind_port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_idle_reaper(sessions: Arc<SessionManager>, idle_timeout: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            sessions.reap_idle(idle_timeout, acp2_bridge::util::now_unix()).await;
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
