//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Wire up the middleware chain and per-route deadlines
//! - Own the long-lived shared state (limiter, gate, tool, buffer pool)
//! - Serve with graceful shutdown and peer addresses for rate limiting

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::GatewayConfig;
use crate::http::handlers;
use crate::http::middleware::{apply_chain, timeout_middleware, ChainState};
use crate::security::RateLimiter;
use crate::worker::{BufferPool, ConcurrencyGate, FlushPolicy, MediaTool};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub tool: Arc<MediaTool>,
    pub gate: ConcurrencyGate,
    pub pool: BufferPool,
    pub flush_policy: FlushPolicy,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    limiter: Arc<RateLimiter>,
    gate: ConcurrencyGate,
}

impl HttpServer {
    /// Create a new HTTP server. `tool` must already be resolved.
    pub fn new(config: GatewayConfig, tool: MediaTool) -> Self {
        let capacity = config.workers.capacity();
        let gate = ConcurrencyGate::new(capacity);
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

        let state = AppState {
            tool: Arc::new(tool),
            gate: gate.clone(),
            pool: BufferPool::new(config.workers.buffer_size, capacity),
            flush_policy: FlushPolicy::new(config.workers.flush_threshold),
        };

        let chain = ChainState {
            cors: Arc::new(config.cors.clone()),
            limiter: limiter.clone(),
            auth: Arc::new(config.auth.clone()),
        };

        let router = Self::build_router(&config, state, chain);
        Self {
            router,
            limiter,
            gate,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GatewayConfig, state: AppState, chain: ChainState) -> Router {
        let worker_routes = Router::new()
            .route("/api/video/info", get(handlers::video_info))
            .route(
                "/api/video/download",
                post(handlers::video_download)
                    .layer(RequestBodyLimitLayer::new(config.workers.max_body_size)),
            )
            .route_layer(from_fn_with_state(
                config.workers.request_timeout(),
                timeout_middleware,
            ));

        let router = Router::new()
            .route("/api/hello", get(handlers::hello))
            .merge(worker_routes)
            .with_state(state);

        apply_chain(router, chain)
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            workers = self.gate.capacity(),
            "HTTP server starting"
        );

        let sweeper = tokio::spawn(self.limiter.clone().run_sweeper(shutdown.resubscribe()));
        let gate = self.gate.clone();

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
                // Requests still queued for a slot fail fast; running workers finish.
                gate.close();
            })
            .await?;

        let _ = sweeper.await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn gate(&self) -> ConcurrencyGate {
        self.gate.clone()
    }
}
