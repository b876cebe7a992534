//! Per-route deadline.
//!
//! The deadline covers the handler up to the response head. Streaming
//! handlers read [`RequestDeadline`] and apply the same instant to the body.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The instant at which the current request must be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline {
    pub at: Instant,
}

impl RequestDeadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
        }
    }

    /// A token cancelled when the deadline passes.
    ///
    /// The timer task exits early if the token is cancelled by its owner,
    /// so callers should cancel (or drop-guard) it once the work is done.
    pub fn token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let timer = token.clone();
        let at = self.at;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        token
    }
}

/// Race the handler against `limit`; 503 when the deadline wins.
pub async fn timeout_middleware(
    State(limit): State<Duration>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let deadline = RequestDeadline::after(limit);
    request.extensions_mut().insert(deadline);
    let path = request.uri().path().to_string();

    match tokio::time::timeout_at(deadline.at, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(path = %path, limit_secs = limit.as_secs(), "Request timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "Request timed out").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn app(limit: Duration) -> Router {
        Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "late"
                }),
            )
            .route(
                "/deadline",
                get(|Extension(deadline): Extension<RequestDeadline>| async move {
                    let remaining = deadline.at.saturating_duration_since(Instant::now());
                    remaining.as_secs().to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(limit, timeout_middleware))
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_gets_503() {
        let response = app(Duration::from_secs(5))
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Request timed out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_visible_to_handler() {
        let response = app(Duration::from_secs(300))
            .oneshot(Request::get("/deadline").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"300");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_fires_at_deadline() {
        let deadline = RequestDeadline::after(Duration::from_secs(10));
        let token = deadline.token();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!token.is_cancelled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(token.is_cancelled());
    }
}
