mod dto;
mod error;
mod handlers;
mod state;
mod validate;

use std::sync::Arc;
use std::time::Duration;

use agentspan_config::Settings;
use agentspan_export::{BackendConfig, ExporterClient, OtlpHttpTransport, ResourceInfo};
use agentspan_pipeline::{spawn_retention_sweep, PipelineConfig, WorkerPool};
use agentspan_store::{Database, JobQueue, JobStore};
use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let settings = Settings::from_env()?;
    info!(
        bind = %settings.bind_addr,
        database = %settings.database_path.display(),
        backend = %settings.backend.url,
        workers = settings.worker.workers,
        environment = %settings.environment,
        "Loaded settings"
    );

    let db = Arc::new(Database::open(&settings.database_path)?);
    let store = JobStore::new(db.clone());
    let queue = Arc::new(JobQueue::new(db));
    queue.requeue_orphans()?;

    let transport = OtlpHttpTransport::new(&BackendConfig {
        base_url: settings.backend.url.clone(),
        public_key: settings.backend.public_key.clone(),
        secret_key: settings.backend.secret_key.clone(),
        timeout: settings.backend.timeout,
    })?;
    let exporter = ExporterClient::new(
        Arc::new(transport),
        ResourceInfo {
            service_name: settings.service_name.clone(),
            environment: settings.environment.clone(),
        },
    );

    let (_config_tx, config_rx) = watch::channel(PipelineConfig::from_settings(&settings));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = WorkerPool::new(store.clone(), queue.clone(), exporter, config_rx);
    let mut tasks = pool.spawn(settings.worker.workers, shutdown_rx.clone());
    tasks.push(spawn_retention_sweep(
        store.clone(),
        settings.retention,
        RETENTION_SWEEP_EVERY,
        shutdown_rx,
    ));

    let state = Arc::new(AppState::new(store, queue));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let app = handlers::router(state).layer(trace_layer).layer(cors);

    info!("Starting server on {}", settings.bind_addr);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining workers");
    shutdown_tx.send_replace(true);
    futures::future::join_all(tasks).await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
