//! Endpoint handlers.
//!
//! # Endpoints
//! - `GET /api/hello`: liveness greeting, no auth
//! - `GET /api/video/info?url=`: metadata JSON from the media tool
//! - `POST /api/video/download`: media bytes streamed as they are produced

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::http::error::{
    ApiError, INVALID_BODY, INVALID_FORMAT_NOTE, INVALID_QUALITY, INVALID_TYPE, INVALID_URL,
};
use crate::http::middleware::RequestDeadline;
use crate::http::server::AppState;
use crate::worker::bridge::{self, StreamJob};
use crate::worker::media_tool::{strip_list_param, DownloadRequest, MediaKind};

const MAX_URL_CHARS: usize = 2000;
const MAX_QUALITY: i64 = 1000;
const MAX_FORMAT_NOTE_CHARS: usize = 100;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloResponse {
    pub message: String,
}

pub async fn hello() -> Json<HelloResponse> {
    Json(HelloResponse {
        message: "Hello World!".to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct InfoParams {
    #[serde(default)]
    pub url: String,
}

/// Body of `POST /api/video/download`.
#[derive(Debug, Deserialize)]
pub struct DownloadBody {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub quality: i64,
    #[serde(default)]
    pub format_note: String,
}

/// Trimmed URL if it is non-empty and short enough.
fn validate_url(raw: &str) -> Result<&str, ApiError> {
    let url = raw.trim();
    if url.is_empty() || url.chars().count() > MAX_URL_CHARS {
        return Err(ApiError::BadRequest(INVALID_URL));
    }
    Ok(url)
}

/// Parse and validate a download body, in the order the checks are reported.
pub fn parse_download(body: &[u8]) -> Result<DownloadRequest, ApiError> {
    let body: DownloadBody =
        serde_json::from_slice(body).map_err(|_| ApiError::BadRequest(INVALID_BODY))?;

    let url = validate_url(&body.url)?;
    let kind = MediaKind::parse(&body.kind).ok_or(ApiError::BadRequest(INVALID_TYPE))?;
    if body.quality > MAX_QUALITY {
        return Err(ApiError::BadRequest(INVALID_QUALITY));
    }
    let note = body.format_note.trim();
    if note.chars().count() > MAX_FORMAT_NOTE_CHARS {
        return Err(ApiError::BadRequest(INVALID_FORMAT_NOTE));
    }

    Ok(DownloadRequest {
        url: strip_list_param(url),
        kind,
        quality: body.quality,
        format_note: (!note.is_empty()).then(|| note.to_string()),
    })
}

fn cancellation(deadline: Option<Extension<RequestDeadline>>) -> CancellationToken {
    match deadline {
        Some(Extension(deadline)) => deadline.token(),
        None => CancellationToken::new(),
    }
}

pub async fn video_info(
    State(state): State<AppState>,
    deadline: Option<Extension<RequestDeadline>>,
    Query(params): Query<InfoParams>,
) -> Result<Response, ApiError> {
    let url = strip_list_param(validate_url(&params.url)?);

    let cancel = cancellation(deadline);
    let _stop_timer = cancel.clone().drop_guard();

    let _permit = state.gate.acquire(&cancel).await?;
    let info = state
        .tool
        .fetch_info(&url, cancel.clone())
        .await
        .map_err(ApiError::Info)?;

    Ok(([(header::CONTENT_TYPE, "application/json")], info).into_response())
}

pub async fn video_download(
    State(state): State<AppState>,
    deadline: Option<Extension<RequestDeadline>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_download(&body)?;

    let cancel = cancellation(deadline);
    let stop_timer = cancel.clone().drop_guard();

    let permit = state.gate.acquire(&cancel).await?;
    let (output, process) = state
        .tool
        .start_download(&request, cancel.clone())
        .map_err(ApiError::DownloadStart)?;

    // The stream task owns the token from here and cancels it when done.
    let cancel = stop_timer.disarm();

    let job = StreamJob {
        output,
        process,
        permit,
        kind: request.kind,
        cancel,
    };
    Ok(bridge::stream_response(job, state.pool.clone(), state.flush_policy))
}
