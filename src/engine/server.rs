use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::config::{Config, RetryPolicy};
use crate::engine::api::{self, AppState};
use crate::engine::db::{DbHandle, EngineDb};
use crate::engine::manager::CampaignManager;
use crate::engine::placement::{
    HttpPlacementClient, PlacementClient, SimulatedOutcome, SimulatedPlacementClient,
};
use crate::engine::ws;

/// Build the full application router with API and WebSocket endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Feed simulated provider outcomes back into the manager, standing in for
/// the webhook the real telephony layer would deliver. Each outcome is
/// delayed independently so slow calls never hold up fast ones.
pub fn spawn_outcome_pump(
    manager: CampaignManager,
    mut outcome_rx: mpsc::UnboundedReceiver<SimulatedOutcome>,
) {
    tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            let manager = manager.clone();
            tokio::spawn(async move {
                if outcome.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(outcome.delay_ms)).await;
                }
                manager.apply_outcome(
                    &outcome.placement_id,
                    outcome.outcome,
                    outcome.duration_secs,
                    None,
                    None,
                );
            });
        }
    });
}

/// Periodically start scheduled campaigns whose start time has passed.
fn spawn_scheduler_tick(manager: CampaignManager, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            let started = manager.start_due_scheduled().await;
            if started > 0 {
                tracing::info!(count = started, "scheduled campaigns started");
            }
        }
    });
}

/// Start the engine server.
///
/// `dev_mode` binds on all interfaces with permissive CORS and swaps the
/// HTTP placement client for the simulated provider.
pub async fn start_server(config: Config, dev_mode: bool) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = DbHandle::new(
        EngineDb::new(&config.server.db_path).context("Failed to initialize engine database")?,
    );
    let (events_tx, _rx) = broadcast::channel::<String>(256);
    let retry = RetryPolicy::from(&config.engine);

    let simulated = dev_mode || config.placement.simulated;
    let (placement, sim_outcome_rx): (Arc<dyn PlacementClient>, _) = if simulated {
        let (client, outcome_rx) = SimulatedPlacementClient::new();
        (Arc::new(client), Some(outcome_rx))
    } else {
        (
            Arc::new(
                HttpPlacementClient::new(
                    config.placement.base_url.clone(),
                    config.placement.api_key.clone(),
                    config.placement.request_timeout_secs,
                )
                .context("Failed to build placement client")?,
            ),
            None,
        )
    };

    let manager = CampaignManager::new(db, events_tx.clone(), placement, retry);
    manager
        .restore()
        .await
        .context("Failed to restore campaigns")?;

    if let Some(outcome_rx) = sim_outcome_rx {
        tracing::info!("placement provider: simulated");
        spawn_outcome_pump(manager.clone(), outcome_rx);
    } else {
        tracing::info!(base_url = %config.placement.base_url, "placement provider: http");
    }
    spawn_scheduler_tick(manager.clone(), config.engine.scheduler_interval_secs);

    let state = Arc::new(AppState {
        manager,
        events_tx,
    });

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "outdial engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}
