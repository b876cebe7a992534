//! One structured log line and metric sample per request.
//!
//! `elapsed_ms` ends when the response head is returned. Streamed download
//! bodies log their own `stream_ms` when the stream ends.

use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};

use crate::observability::metrics;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn access_log_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status();
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        request_id = %request_id,
        "Request handled"
    );
    metrics::record_request(method.as_str(), status.as_u16(), start);

    response
}
