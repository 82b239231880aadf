// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::orchestrator::{OrchestratorRegistry, TelemetryOrchestrator};
use crate::application::telemetry_provider::TelemetryProvider;
use crate::domain::telemetry::ViewIdentity;
use crate::infrastructure::config::load_app_config;
use crate::infrastructure::provider_client::HttpTelemetryProvider;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    export_csv, get_view, health_check, list_views, put_identity, retry_view, stream_view,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_app_config()?;

    // Create provider (infrastructure layer)
    let provider: Arc<dyn TelemetryProvider> = Arc::new(HttpTelemetryProvider::new(
        config.provider.kind,
        &config.provider.base_url,
        Duration::from_secs(config.provider.timeout_secs),
    )?);

    // Create one orchestrator per view (application layer)
    let mut views = Vec::with_capacity(config.views.len());
    for view_config in &config.views {
        let settings = view_config.to_settings(config.retry)?;
        views.push(TelemetryOrchestrator::new(settings, provider.clone()));
    }
    let registry = OrchestratorRegistry::new(views);

    let identity: ViewIdentity = config.identity.into();
    registry.start_all(&identity);
    tracing::info!(
        views = config.views.len(),
        provider = ?config.provider.kind,
        entity = %identity.entity_id,
        "telemetry views started"
    );

    let state = Arc::new(AppState {
        views: registry.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/views", get(list_views))
        .route("/views/:name", get(get_view))
        .route("/views/:name/stream", get(stream_view))
        .route("/views/:name/retry", post(retry_view))
        .route("/views/:name/export.csv", get(export_csv))
        .route("/identity", put(put_identity))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config.server.bind.parse()?;
    tracing::info!("Starting solar-telemetry service on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.stop_all();
    Ok(())
}
