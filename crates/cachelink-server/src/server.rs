use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use cachelink_core::{CacheEngine, ClearCoordinator};
use cachelink_storage::{LocalStore, RedisTransport, StorageAdapter, Transport};
use tower_http::trace::TraceLayer;

use crate::broadcast::Broadcaster;
use crate::config::AppConfig;
use crate::middleware as app_middleware;
use crate::routes::{broadcast, cache, system};
use crate::state::AppState;

pub struct CachelinkServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    cron_enabled: bool,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let mut router = Router::new()
        .route("/healthz", get(system::healthz))
        .route("/metrics", get(system::metrics))
        .route("/", get(cache::get_many).put(cache::set).delete(cache::clear))
        .route(
            "/clear-later",
            get(cache::clear_later).put(cache::clear_later),
        )
        .route("/clear-later/{key}", get(cache::clear_later))
        .route("/clear", get(cache::clear))
        .route("/clear/{key}", get(cache::clear))
        .route("/clear-now", get(cache::clear_now))
        .route("/clear-counts", get(cache::clear_counts))
        .route("/broadcast/{operation}", post(broadcast::receive))
        .route(
            "/{key}",
            get(cache::get_one).put(cache::set).delete(cache::clear),
        )
        .route_layer(middleware::from_fn(app_middleware::http_metrics))
        .with_state(state);

    if let Some(auth) = cfg.server.basic_auth.clone() {
        tracing::info!("Basic auth enabled");
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(auth),
            app_middleware::basic_auth,
        ));
    }

    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::debug!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Opens the backend named by `cfg.redis`.
pub async fn connect_storage(cfg: &AppConfig) -> anyhow::Result<Arc<StorageAdapter>> {
    let options = cfg.redis.options().map_err(anyhow::Error::msg)?;
    let transport: Arc<dyn Transport> = match options {
        None => {
            tracing::warn!("Using the in-process store; data is not shared between instances");
            Arc::new(LocalStore::new())
        }
        Some(options) => {
            tracing::info!(nodes = options.nodes.len(), topology = ?options.topology, "Connecting to Redis");
            Arc::new(
                RedisTransport::connect(options)
                    .await
                    .context("failed to connect to Redis")?,
            )
        }
    };
    Ok(Arc::new(StorageAdapter::new(transport)?))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    storage: Option<Arc<StorageAdapter>>,
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
            storage: None,
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

    /// Use an already opened backend instead of connecting from the config.
    pub fn with_storage(mut self, storage: Arc<StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub async fn build(self) -> anyhow::Result<CachelinkServer> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => connect_storage(&self.config).await?,
        };
        let engine = Arc::new(CacheEngine::new(storage, self.config.cache_settings()));
        let coordinator = ClearCoordinator::new(engine, self.config.coordinator_settings());
        let broadcaster = Broadcaster::new(
            &self.config.broadcast.targets,
            Duration::from_secs(self.config.broadcast.timeout_secs),
            self.config.server.basic_auth.clone(),
        )?;
        if broadcaster.is_enabled() {
            tracing::info!(targets = ?broadcaster.targets(), "Broadcasting to sibling clusters");
        }

        let state = AppState::new(coordinator, broadcaster);
        let app = build_app(state.clone(), &self.config);

        Ok(CachelinkServer {
            addr: self.addr,
            app,
            state,
            cron_enabled: self.config.coordinator.cron_enabled,
        })
    }
}

impl CachelinkServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Starts the coordinator's background tasks without serving HTTP.
    pub async fn start_background(&self) -> anyhow::Result<()> {
        let coordinator = &self.state.coordinator;
        if self.cron_enabled {
            coordinator.start_cron();
        }
        coordinator
            .listen_for_messages()
            .await
            .context("failed to subscribe to the drain channel")?;
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.start_background().await?;
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        self.state.coordinator.shutdown();
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
