//! API key authentication for the protected path prefix.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::AuthConfig;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Rejects requests under the protected prefix whose `X-API-KEY` does not
/// match the configured key. The exempt path and everything outside the
/// prefix pass untouched.
pub async fn auth_middleware(
    State(config): State<Arc<AuthConfig>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let path = request.uri().path();

    if path == config.exempt_path || !path.starts_with(&config.protected_prefix) {
        return Ok(next.run(request).await);
    }

    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|key| key == config.api_key);

    if !authorized {
        tracing::debug!(path = %path, "Rejected request without a valid API key");
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Arc::new(AuthConfig {
            api_key: "secret".into(),
            ..AuthConfig::default()
        });
        Router::new()
            .route("/api/hello", get(|| async { "hello" }))
            .route("/api/other", get(|| async { "other" }))
            .route("/home", get(|| async { "home" }))
            .layer(middleware::from_fn_with_state(config, auth_middleware))
    }

    async fn status_of(request: Request<Body>) -> StatusCode {
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_hello_is_exempt() {
        let request = Request::get("/api/hello").body(Body::empty()).unwrap();
        assert_eq!(status_of(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_key_is_rejected() {
        let request = Request::get("/api/other").body(Body::empty()).unwrap();
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);

        let request = Request::get("/api/other")
            .header(API_KEY_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_correct_key_is_accepted() {
        let request = Request::get("/api/other")
            .header(API_KEY_HEADER, "secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_paths_outside_prefix_pass() {
        let request = Request::get("/home").body(Body::empty()).unwrap();
        assert_eq!(status_of(request).await, StatusCode::OK);
    }
}
