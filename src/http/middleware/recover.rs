//! Panic isolation for the request pipeline.

use std::panic::AssertUnwindSafe;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;

use crate::worker::bridge::panic_message;

/// Turn a panic anywhere below into a 500 and keep the server running.
pub async fn recover_middleware(request: Request<Body>, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            tracing::error!("Recovered from panic: {}", panic_message(panic.as_ref()));
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}
