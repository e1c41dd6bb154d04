use axum::extract::FromRef;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::binder::Binder;
use crate::config::Config;
use crate::envelope::EnvelopeConfig;
use crate::handlers::{health_check, mark_started, not_found};
use crate::middleware::{
    logging_middleware, method_not_allowed_middleware, rate_limit_middleware, trace_middleware,
    RequestLoggingConfig,
};
use crate::rate_limiter::FixedWindowLimiter;
use crate::redis::RedisRateLimitStore;
use crate::store::{MemoryRateLimitStore, RateLimitStore, StoreError};
use crate::trace::TraceConfig;
use crate::validation::RecursiveValidator;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to set up rate limit store: {0}")]
    Store(#[from] StoreError),

    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub envelope: EnvelopeConfig,
    pub limiter: Arc<FixedWindowLimiter>,
    pub request_logging: RequestLoggingConfig,
    pub trace: Arc<TraceConfig>,
}

impl AppState {
    pub fn new(envelope: EnvelopeConfig, limiter: Arc<FixedWindowLimiter>) -> Self {
        Self {
            envelope,
            limiter,
            request_logging: RequestLoggingConfig::default(),
            trace: Arc::new(TraceConfig::default()),
        }
    }

    pub fn with_request_logging(mut self, request_logging: RequestLoggingConfig) -> Self {
        self.request_logging = request_logging;
        self
    }

    pub fn with_trace(mut self, trace: TraceConfig) -> Self {
        self.trace = Arc::new(trace);
        self
    }

    /// Builds state from configuration, connecting to Redis when a URL is set.
    pub async fn from_config(config: &Config) -> Result<Self, ServerError> {
        let validator = match config.max_validation_depth {
            Some(depth) => RecursiveValidator::with_max_depth(depth),
            None => RecursiveValidator::new(),
        };
        let envelope =
            EnvelopeConfig::new(Binder::new(validator)).with_max_body_bytes(config.max_body_bytes);

        let store: Arc<dyn RateLimitStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisRateLimitStore::connect(url).await?),
            None => {
                info!(
                    event = "memory_store_selected",
                    "No Redis URL configured, keeping rate limits in process"
                );
                Arc::new(MemoryRateLimitStore::new())
            }
        };
        let limiter = FixedWindowLimiter::new(store, config.rate_limit, config.rate_limit_window());

        Ok(Self::new(envelope, Arc::new(limiter))
            .with_request_logging(config.request_logging())
            .with_trace(config.trace()))
    }

    pub fn binder(&self) -> &Binder {
        &self.envelope.binder
    }
}

impl FromRef<AppState> for EnvelopeConfig {
    fn from_ref(state: &AppState) -> Self {
        state.envelope.clone()
    }
}

impl FromRef<AppState> for Arc<FixedWindowLimiter> {
    fn from_ref(state: &AppState) -> Self {
        state.limiter.clone()
    }
}

/// Assembles the full router around caller-supplied `routes`.
///
/// `routes` are rate limited; `/health` and the fallback are not.
pub fn build_router(state: AppState, routes: Router<AppState>) -> Router {
    let limited = routes.layer(from_fn_with_state(
        state.limiter.clone(),
        rate_limit_middleware,
    ));
    let request_logging = state.request_logging;
    let trace = state.trace.clone();

    Router::new()
        .route("/health", get(health_check))
        .merge(limited)
        .fallback(not_found)
        .layer(from_fn(method_not_allowed_middleware))
        .layer(from_fn_with_state(request_logging, logging_middleware))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(trace, trace_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    store: Arc<dyn RateLimitStore>,
    cleanup_interval: Duration,
}

impl Server {
    pub fn new(config: &Config, state: AppState, routes: Router<AppState>) -> Self {
        let store = state.limiter.store().clone();
        Self {
            app: build_router(state, routes),
            bind_addr: config.bind_addr,
            store,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> Result<(), ServerError> {
        info!(event = "app_starting", bind_addr = %self.bind_addr, "Starting server");
        mark_started();

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let cleanup = tokio::spawn(cleanup_task(self.store.clone(), self.cleanup_interval));

        info!(
            event = "app_started",
            bind_addr = %listener.local_addr()?,
            "Server listening, health check available at /health"
        );

        // Run server with graceful shutdown
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        cleanup.abort();
        served?;
        info!(event = "app_stopped", "Server stopped");
        Ok(())
    }
}

async fn cleanup_task(store: Arc<dyn RateLimitStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.evict_expired(SystemTime::now()).await {
            Ok(evicted) => debug!(event = "rate_limit_cleanup", evicted, "Evicted expired records"),
            Err(err) => error!(event = "rate_limit_cleanup_failed", error = %err, "Cleanup failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
