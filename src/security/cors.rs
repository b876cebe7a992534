//! Development-only cross-origin policy.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::{CorsConfig, RunMode};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-API-KEY";

/// In development mode, allow the configured client origin and answer
/// preflight requests directly. In production this is a pass-through.
pub async fn cors_middleware(
    State(config): State<Arc<CorsConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if config.mode != RunMode::Development {
        return next.run(request).await;
    }

    let mut response = if *request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    match HeaderValue::from_str(&config.client_url) {
        Ok(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        Err(_) => {
            tracing::warn!(client_url = %config.client_url, "CLIENT_URL is not a valid header value");
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    fn app(mode: RunMode, called: Arc<AtomicBool>) -> Router {
        let config = Arc::new(CorsConfig {
            mode,
            client_url: "http://example.com".into(),
        });
        Router::new()
            .route(
                "/test",
                get(move || {
                    called.store(true, Ordering::SeqCst);
                    async { StatusCode::IM_A_TEAPOT }
                })
                .options(|| async { StatusCode::OK }),
            )
            .layer(middleware::from_fn_with_state(config, cors_middleware))
    }

    #[tokio::test]
    async fn test_development_sets_headers_and_calls_inner() {
        let called = Arc::new(AtomicBool::new(false));
        let response = app(RunMode::Development, called.clone())
            .oneshot(Request::get("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://example.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
    }

    #[tokio::test]
    async fn test_development_preflight_short_circuits() {
        let called = Arc::new(AtomicBool::new(false));
        let response = app(RunMode::Development, called.clone())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://example.com"
        );
    }

    #[tokio::test]
    async fn test_production_is_pass_through() {
        let called = Arc::new(AtomicBool::new(false));
        let response = app(RunMode::Production, called.clone())
            .oneshot(Request::get("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).is_none());
    }
}
