mod cache;
mod config;
mod credentials;
mod ebay;
mod filter;
mod health;
mod http;
mod metrics;
mod models;
mod notify;
mod scheduler;
mod store;
mod supabase;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use cache::ItemCache;
use config::WorkerConfig;
use credentials::CredentialPool;
use ebay::{BrowseClient, Marketplace};
use health::{HealthRecorder, HealthStatus};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use notify::{LogSink, NotificationSink, Notifier, WebhookSink};
use scheduler::{Scheduler, SchedulerDeps};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{MemoryStore, WorkerStore};
use supabase::SupabaseClient;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "hermes.scout", "worker crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = WorkerConfig::load()?;
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let http = http::build_client(&config.http);

    let store: Arc<dyn WorkerStore> = match SupabaseClient::from_env(http.clone()) {
        Some(client) => {
            info!(target = "hermes.supabase", "using_supabase_store");
            Arc::new(client)
        }
        None => {
            warn!(target = "hermes.supabase", "supabase_not_configured_using_memory_store");
            Arc::new(MemoryStore::seeded_from_env()?)
        }
    };
    let cache = ItemCache::from_config(&config.cache).await;
    info!(target = "hermes.cache", backend = cache.backend_name(), "item_cache_ready");

    let marketplace: Arc<dyn Marketplace> =
        Arc::new(BrowseClient::new(http.clone(), config.ebay.clone()));
    let pool = Arc::new(CredentialPool::new(config.pool.clone()));
    let sink: Arc<dyn NotificationSink> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(http.clone(), url.clone())),
        None => Arc::new(LogSink),
    };
    let (notifier, _notify_worker) = Notifier::spawn(sink, config.notify.queue_capacity);
    let health = HealthRecorder::new(store.clone());

    let scheduler = Arc::new(Scheduler::new(
        &config,
        SchedulerDeps {
            pool: pool.clone(),
            marketplace,
            store,
            cache,
            notifier,
            health: health.clone(),
        },
    ));
    let worker = tokio::spawn(scheduler.run());

    let state = AppState {
        health,
        pool,
        prometheus_handle,
        poll_interval: config.scheduler.poll_interval(),
        metrics_key: config.server.metrics_key.clone(),
    };
    let app = Router::new()
        .route("/health", get(health_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    info!(target = "hermes.scout", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker.abort();
    info!(target = "hermes.scout", "worker_stopped");
    Ok(())
}

#[derive(Clone)]
struct AppState {
    health: HealthRecorder,
    pool: Arc<CredentialPool>,
    prometheus_handle: PrometheusHandle,
    poll_interval: Duration,
    metrics_key: Option<String>,
}

/// Worker liveness.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Reports the last cycle record, per-credential usage and a status of
/// `starting`, `healthy`, `degraded` or `stale`. Stale answers 503.
async fn health_endpoint(State(state): State<AppState>) -> Response {
    let last = state.health.last().await;
    let status = health::assess(last.as_ref(), chrono::Utc::now(), state.poll_interval);
    let code = match status {
        HealthStatus::Stale => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let body = Json(json!({
        "status": status,
        "service": "hermes-scout-rs",
        "last_cycle": last,
        "credentials": state.pool.snapshot(),
    }));
    (code, body).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = state.metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target = "hermes.scout", error = %err, "signal_handler_failed");
        std::future::pending::<()>().await;
    }
    info!(target = "hermes.scout", "shutdown_requested");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
