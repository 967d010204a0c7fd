use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware, routing::get};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use bulkport_core::RequestValidator;
use bulkport_db_memory::{InMemoryJobStore, InMemoryWorkQueue};
use bulkport_db_postgres::PostgresBackend;
use bulkport_storage::{DynJobStore, DynWorkQueue};

use crate::config::{AppConfig, StorageBackend, StorageConfig, UpstreamConfig};
use crate::export::{
    AdmissionPolicy, ClockWatermark, JobOrchestrator, StatusService, SweepDirs, SweepThresholds,
    Sweeper, UpstreamWatermark, WatermarkSource, export_routes,
};
use crate::middleware::{AuthTokens, authentication_middleware, request_id};
use crate::handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: DynJobStore,
    pub validator: Arc<RequestValidator>,
    pub orchestrator: JobOrchestrator,
    pub status: Arc<StatusService>,
    pub auth: Arc<AuthTokens>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: DynJobStore,
        queue: DynWorkQueue,
        watermark: Arc<dyn WatermarkSource>,
    ) -> Self {
        let export = &config.export;
        let validator = RequestValidator::new(export.supported_types());
        let orchestrator = JobOrchestrator::new(
            store.clone(),
            queue.clone(),
            watermark,
            AdmissionPolicy::from(export),
        );
        let status = StatusService::new(
            store.clone(),
            queue,
            export.retention(),
            export.payload_dir.clone(),
        );

        Self {
            store,
            validator: Arc::new(validator),
            orchestrator,
            status: Arc::new(status),
            auth: Arc::new(AuthTokens::from_config(&config.auth)),
            config: Arc::new(config),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    let api = export_routes().route_layer(middleware::from_fn_with_state(
        state.auth.clone(),
        authentication_middleware,
    ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(api)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        // Outermost so the id is in extensions before the span is created
        .layer(middleware::from_fn(request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Opens the configured job store and work queue.
pub async fn connect_storage(cfg: &StorageConfig) -> anyhow::Result<(DynJobStore, DynWorkQueue)> {
    match cfg.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; jobs are lost on restart");
            Ok((
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryWorkQueue::new()),
            ))
        }
        StorageBackend::Postgres => {
            let pg = cfg
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.postgres is required for the postgres backend"))?;
            let backend = PostgresBackend::connect(pg).await?;
            Ok((Arc::new(backend.job_store()), Arc::new(backend.work_queue())))
        }
    }
}

pub fn watermark_source(cfg: &UpstreamConfig) -> anyhow::Result<Arc<dyn WatermarkSource>> {
    match &cfg.base_url {
        Some(url) => {
            tracing::info!(upstream = %url, "Transaction times taken from upstream");
            Ok(Arc::new(UpstreamWatermark::new(url, cfg.timeout())?))
        }
        None => Ok(Arc::new(ClockWatermark)),
    }
}

pub fn build_sweeper(cfg: &AppConfig, store: DynJobStore, queue: DynWorkQueue) -> Sweeper {
    Sweeper::new(
        store,
        queue,
        SweepDirs::from(&cfg.export),
        SweepThresholds::from(cfg),
    )
}

pub struct BulkportServer {
    addr: SocketAddr,
    app: Router,
    sweeper: Option<(Arc<Sweeper>, Duration)>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<BulkportServer> {
        let (store, queue) = connect_storage(&self.config.storage).await?;
        let watermark = watermark_source(&self.config.upstream)?;

        let sweeper = self.config.sweeper.enabled.then(|| {
            (
                Arc::new(build_sweeper(&self.config, store.clone(), queue.clone())),
                self.config.sweeper.interval(),
            )
        });

        let state = AppState::new(self.config, store, queue, watermark);
        Ok(BulkportServer {
            addr: self.addr,
            app: build_app(state),
            sweeper,
        })
    }
}

impl BulkportServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let sweep_task = self.sweeper.map(|(sweeper, interval)| {
            tracing::info!(interval_secs = interval.as_secs(), "Retention sweeper started");
            sweeper.spawn(interval)
        });

        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        if let Some(task) = sweep_task {
            task.abort();
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
