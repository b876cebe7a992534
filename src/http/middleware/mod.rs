//! Middleware chain.
//!
//! # Order (outermost first)
//! ```text
//! recover → access_log → request id → cors → rate_limit → auth → [timeout] → handler
//! ```
//! `timeout` is a route layer on the worker-backed routes only.

pub mod access_log;
pub mod recover;
pub mod timeout;

use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::config::{AuthConfig, CorsConfig};
use crate::security::auth::auth_middleware;
use crate::security::cors::cors_middleware;
use crate::security::rate_limit::rate_limit_middleware;
use crate::security::RateLimiter;

pub use access_log::access_log_middleware;
pub use recover::recover_middleware;
pub use timeout::{timeout_middleware, RequestDeadline};

/// Shared state for the global layers.
#[derive(Clone)]
pub struct ChainState {
    pub cors: Arc<CorsConfig>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthConfig>,
}

/// Wrap `router` in the global chain. The first layer listed sees the
/// request first and the response last.
pub fn apply_chain(router: Router, chain: ChainState) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(from_fn(recover_middleware))
            .layer(from_fn(access_log_middleware))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(from_fn_with_state(chain.cors, cors_middleware))
            .layer(from_fn_with_state(chain.limiter, rate_limit_middleware))
            .layer(from_fn_with_state(chain.auth, auth_middleware)),
    )
}
