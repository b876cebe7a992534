//! Handler errors and their HTTP mapping.
//!
//! Bodies are plain text and never carry internal details; the cause is
//! logged instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::worker::{GateError, WorkerError};

pub const INVALID_URL: &str =
    "url parameter is required and must be a valid URL with a maximum length of 2000 characters";
pub const INVALID_BODY: &str = "invalid request body";
pub const INVALID_TYPE: &str = "type parameter must be either 'video' or 'audio'";
pub const INVALID_QUALITY: &str = "quality parameter must be less than or equal to 1000";
pub const INVALID_FORMAT_NOTE: &str =
    "format_note parameter must be less than or equal to 100 characters";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error("request was cancelled before acquiring a worker slot")]
    GateCancelled,

    #[error("worker gate closed")]
    GateClosed,

    #[error("media tool failed while fetching info: {0}")]
    Info(#[source] WorkerError),

    #[error("media tool failed to start download: {0}")]
    DownloadStart(#[source] WorkerError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::GateCancelled => StatusCode::REQUEST_TIMEOUT,
            Self::GateClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Info(_) | Self::DownloadStart(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            Self::BadRequest(msg) => msg,
            Self::GateCancelled => "request was cancelled before acquiring a worker slot",
            Self::GateClosed => "Service Unavailable",
            Self::Info(_) => "failed to fetch video info",
            Self::DownloadStart(_) => "download failed to start",
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Cancelled => Self::GateCancelled,
            GateError::Closed => Self::GateClosed,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, self.public_message()).into_response()
    }
}
