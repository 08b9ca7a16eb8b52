//! meteo-server entrypoint.

use std::sync::Arc;

use tracing::{error, info, warn};

use meteo_core::api::{build_router, AppState};
use meteo_core::config::Config;
use meteo_core::db::JobStore;
use meteo_core::jobs::{JobExecutor, WeatherJobHandler};
use meteo_core::observability;
use meteo_core::provider::WeatherProvider;
use meteo_core::registry::JobRegistry;
use meteo_core::scheduler::Scheduler;
use meteo_core::websocket::Broadcaster;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration ({}); using defaults", e);
            Config::default()
        }
    };

    observability::init(&config.observability);
    info!("Starting meteo-server");

    // A working store is a hard startup requirement.
    let store = match JobStore::connect(&config.database).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    let registry = JobRegistry::new(store, config.jobs.max_history);
    let broadcaster = Arc::new(Broadcaster::new());
    let provider = Arc::new(WeatherProvider::new(&config.weather)?);

    let mut executor = JobExecutor::new(registry.clone(), broadcaster.clone());
    executor.register_handler(Arc::new(WeatherJobHandler::new(provider.clone())));
    let executor = Arc::new(executor);

    let scheduler = Scheduler::new(registry.clone(), executor.clone());
    scheduler.start().await?;

    let state = AppState {
        scheduler: scheduler.clone(),
        registry,
        executor,
        provider,
        broadcaster,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
